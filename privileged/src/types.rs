//! Declared parameter types of privileged actions.
//!
//! Every parameter of an action carries a [`Type`] descriptor that is
//! matched against the JSON value received from the caller.  The
//! descriptor is derived at compile time from the Rust parameter type
//! through [`ArgType`].

use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    hash::{BuildHasher, Hash},
    ops,
};

/// Replacement text for secret values in logs.
pub const REDACTED: &str = "****";

/// Type descriptor of a declared parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// Any JSON value.
    Any,
    Bool,
    /// Integer, never a boolean or a float.
    Int,
    /// Float, never an integer.
    Float,
    Str,
    /// A string that must not show up in logs.
    Secret,
    /// `null` or the inner type.
    Optional(Box<Type>),
    /// Any one of the member types.
    Union(Vec<Type>),
    /// A list whose elements all match the inner type.
    List(Box<Type>),
    /// A mapping whose keys and values match the given types.
    Dict(Box<Type>, Box<Type>),
}

impl Type {
    pub fn optional(inner: Type) -> Self {
        Self::Optional(Box::new(inner))
    }

    pub fn union(members: impl IntoIterator<Item = Type>) -> Self {
        Self::Union(members.into_iter().collect())
    }

    pub fn list(inner: Type) -> Self {
        Self::List(Box::new(inner))
    }

    pub fn dict(key: Type, value: Type) -> Self {
        Self::Dict(Box::new(key), Box::new(value))
    }

    /// Returns `true` if values of this type may contain a secret.
    pub fn is_secret(&self) -> bool {
        match self {
            Self::Secret => true,
            Self::Optional(inner) | Self::List(inner) => inner.is_secret(),
            Self::Union(members) => members.iter().any(Type::is_secret),
            Self::Dict(key, value) => key.is_secret() || value.is_secret(),
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::Bool => f.write_str("bool"),
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::Str => f.write_str("str"),
            Self::Secret => f.write_str("secret_str"),
            Self::Optional(inner) => write!(f, "{} | None", inner),
            Self::Union(members) => {
                for (index, member) in members.iter().enumerate() {
                    if index > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{}", member)?;
                }
                Ok(())
            }
            Self::List(inner) if **inner == Self::Any => f.write_str("list"),
            Self::List(inner) => write!(f, "list[{}]", inner),
            Self::Dict(key, value) if **key == Self::Any && **value == Self::Any => {
                f.write_str("dict")
            }
            Self::Dict(key, value) => write!(f, "dict[{}, {}]", key, value),
        }
    }
}

/// Rust types that can be declared as action parameters.
///
/// Implement this for an untagged enum to declare a [`Type::Union`].
pub trait ArgType: DeserializeOwned {
    fn descriptor() -> Type;
}

macro_rules! arg_type {
    ($($ty:ty => $descriptor:expr),* $(,)?) => {
        $(
            impl ArgType for $ty {
                fn descriptor() -> Type {
                    $descriptor
                }
            }
        )*
    };
}

arg_type! {
    bool => Type::Bool,
    i8 => Type::Int,
    i16 => Type::Int,
    i32 => Type::Int,
    i64 => Type::Int,
    isize => Type::Int,
    u8 => Type::Int,
    u16 => Type::Int,
    u32 => Type::Int,
    u64 => Type::Int,
    usize => Type::Int,
    f32 => Type::Float,
    f64 => Type::Float,
    String => Type::Str,
    Secret => Type::Secret,
    Value => Type::Any,
    Map<String, Value> => Type::dict(Type::Any, Type::Any),
}

impl<T: ArgType> ArgType for Option<T> {
    fn descriptor() -> Type {
        Type::optional(T::descriptor())
    }
}

impl<T: ArgType> ArgType for Vec<T> {
    fn descriptor() -> Type {
        Type::list(T::descriptor())
    }
}

impl<K: ArgType + Ord, V: ArgType> ArgType for BTreeMap<K, V> {
    fn descriptor() -> Type {
        Type::dict(K::descriptor(), V::descriptor())
    }
}

impl<K, V, S> ArgType for HashMap<K, V, S>
where
    K: ArgType + Eq + Hash,
    V: ArgType,
    S: BuildHasher + Default,
{
    fn descriptor() -> Type {
        Type::dict(K::descriptor(), V::descriptor())
    }
}

/// A string argument that is redacted in all logs.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl ops::Deref for Secret {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", REDACTED)
    }
}

impl From<String> for Secret {
    fn from(secret: String) -> Self {
        Self(secret)
    }
}

impl From<&str> for Secret {
    fn from(secret: &str) -> Self {
        Self(secret.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{ArgType, Secret, Type};
    use serde_json::{Map, Value};
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn test_descriptor_names() {
        assert_eq!(bool::descriptor().to_string(), "bool");
        assert_eq!(u16::descriptor().to_string(), "int");
        assert_eq!(f64::descriptor().to_string(), "float");
        assert_eq!(Option::<String>::descriptor().to_string(), "str | None");
        assert_eq!(Vec::<Value>::descriptor().to_string(), "list");
        assert_eq!(Vec::<i64>::descriptor().to_string(), "list[int]");
        assert_eq!(
            HashMap::<String, Vec<String>>::descriptor().to_string(),
            "dict[str, list[str]]"
        );
        assert_eq!(Map::<String, Value>::descriptor().to_string(), "dict");
        assert_eq!(
            Type::union([Type::Int, Type::Str, Type::Bool]).to_string(),
            "int | str | bool"
        );
        assert_eq!(Value::descriptor().to_string(), "Any");
    }

    #[test]
    fn test_secret_detection() {
        assert!(Secret::descriptor().is_secret());
        assert!(Option::<Secret>::descriptor().is_secret());
        assert!(BTreeMap::<String, Secret>::descriptor().is_secret());
        assert!(Type::union([Type::Int, Type::Secret]).is_secret());
        assert!(!Vec::<String>::descriptor().is_secret());
    }

    #[test]
    fn test_secret_never_printed() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(****)");
        assert_eq!(secret.expose(), "hunter2");
        assert_eq!(
            serde_json::to_value(&secret).unwrap(),
            Value::String("hunter2".to_string())
        );
    }
}
