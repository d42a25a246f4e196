//! `RUST_LOG`-style directive filtering for slog drains.

use derive_more::From;
use slog::{Drain, Level, OwnedKVList, Record};
use std::{env, str::FromStr};

/// Environment variable that overrides the configured directives.
pub const ENV_FILTER: &str = "RUST_LOG";

#[derive(From, Debug, PartialEq)]
struct Filter {
    module: Option<String>,
    level: Level,
}

impl Filter {
    #[inline]
    fn match_module(&self, module: &str) -> Option<&Self> {
        self.module
            .as_ref()
            .map_or(Some(self), |prefix| module.starts_with(prefix).then(|| self))
    }

    #[inline]
    fn match_level(&self, level: Level) -> bool {
        level.is_at_least(self.level)
    }
}

#[derive(Debug, Default)]
struct Directives(Vec<Filter>);

impl Directives {
    #[inline]
    fn is_enabled(&self, module: &str, level: Level) -> bool {
        // The last matching directive wins.
        self.0
            .iter()
            .filter_map(|filter| filter.match_module(module))
            .last()
            .map(|filter| filter.match_level(level))
            .unwrap_or_default()
    }
}

/// Parse filter to be a list of valid prefix strings.
///
/// `module=level` or `level` where the module is a valid module
/// prefix and the level a supported level name (`critical`, `error`,
/// `warn`, `info`, `debug`, `trace`).
///
/// This method does not fail as it will ignore invalid directives.
impl From<&str> for Directives {
    fn from(filter: &str) -> Self {
        let filters = filter
            .split(',')
            .map(str::trim)
            .filter_map(|directive| match directive.split_once('=') {
                None => Level::from_str(directive).ok().map(|level| (None, level)),
                Some((module, level)) => {
                    let valid = !module.is_empty()
                        && module
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_'));
                    valid
                        .then(|| module.to_string())
                        .and_then(|module| {
                            Level::from_str(level).ok().map(|level| (Some(module), level))
                        })
                }
            })
            .map(Into::into)
            .collect();

        Self(filters)
    }
}

/// Drain wrapper that drops records not enabled by the directives.
pub struct Logger<T: Drain> {
    drain: T,
    directives: Directives,
}

impl<T: Drain> Logger<T> {
    /// Use `RUST_LOG` if it is set, the given directives otherwise.
    pub fn with_default_filter(drain: T, filter: &str) -> Self {
        let directives = match env::var(ENV_FILTER) {
            Ok(filter) if !filter.is_empty() => Directives::from(filter.as_str()),
            _ => Directives::from(filter),
        };

        Self { drain, directives }
    }
}

impl<T> Drain for Logger<T>
where
    T: Drain<Ok = ()>,
{
    type Err = T::Err;
    type Ok = ();

    fn log(&self, info: &Record<'_>, val: &OwnedKVList) -> Result<(), T::Err> {
        if !self.directives.is_enabled(info.module(), info.level()) {
            return Ok(());
        }

        self.drain.log(info, val)
    }
}
