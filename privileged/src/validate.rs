//! Argument validation against declared parameters.
//!
//! The caller sends `{"args": [...], "kwargs": {...}}`.  Before an action
//! runs, the payload is bound to the declared parameters: counts and
//! names are checked first, types last.  Nothing in the payload is ever
//! coerced; an integer is not a float and a boolean is not an integer.

use crate::{action::Param, error::Error, types::Type};
use serde_json::{Map, Value};

/// Bind the payload to the parameters.
///
/// Returns the argument values in declared parameter order with
/// defaults filled in.
pub fn validate(params: &[Param], arguments: &Value) -> Result<Vec<Value>, Error> {
    let (args, kwargs) = split_arguments(arguments)?;

    if args.len() > params.len() {
        return Err(Error::syntax("Too many arguments"));
    }

    let mut values = Vec::with_capacity(params.len());
    for (index, param) in params.iter().enumerate() {
        let positional = args.get(index);
        let keyword = kwargs.get(param.name);

        let value = match (positional, keyword, param.default.as_ref()) {
            (Some(_), Some(_), _) => {
                return Err(Error::syntax(format!("Duplicate argument: {}", param.name)))
            }
            (Some(value), None, _) | (None, Some(value), _) | (None, None, Some(value)) => value,
            (None, None, None) => {
                return Err(Error::syntax(format!(
                    "Argument not provided: {}",
                    param.name
                )))
            }
        };
        values.push(value.clone());
    }

    if args.len() + kwargs.len() > params.len() {
        return Err(Error::syntax("Too many arguments"));
    }

    if let Some(name) = kwargs
        .keys()
        .find(|name| !params.iter().any(|param| param.name == name.as_str()))
    {
        return Err(Error::syntax(format!("Unknown argument: {}", name)));
    }

    for (index, (param, value)) in params.iter().zip(args).enumerate() {
        check_type(value, &param.ty, &format!("arg #{}", index))?;
    }
    for param in &params[args.len()..] {
        if let Some(value) = kwargs.get(param.name) {
            check_type(value, &param.ty, &format!("arg {}", param.name))?;
        }
    }

    Ok(values)
}

fn split_arguments(arguments: &Value) -> Result<(&Vec<Value>, &Map<String, Value>), Error> {
    let invalid = || Error::syntax("Invalid arguments format");

    let arguments = arguments.as_object().ok_or_else(invalid)?;
    if arguments.len() != 2 {
        return Err(invalid());
    }
    let args = arguments
        .get("args")
        .and_then(Value::as_array)
        .ok_or_else(invalid)?;
    let kwargs = arguments
        .get("kwargs")
        .and_then(Value::as_object)
        .ok_or_else(invalid)?;

    Ok((args, kwargs))
}

/// Check a single value against a type descriptor.
pub fn check_type(value: &Value, ty: &Type, label: &str) -> Result<(), Error> {
    if matches_type(value, ty, label)? {
        Ok(())
    } else {
        Err(Error::Type(format!("Expected type {} for {}", ty, label)))
    }
}

/// Container element errors are reported with their own label, so a
/// mismatch deep inside a list names the offending element.
fn matches_type(value: &Value, ty: &Type, label: &str) -> Result<bool, Error> {
    let matches = match ty {
        Type::Any => true,
        Type::Bool => value.is_boolean(),
        Type::Int => value.is_i64() || value.is_u64(),
        Type::Float => value.is_f64(),
        Type::Str | Type::Secret => value.is_string(),
        Type::Optional(inner) => value.is_null() || matches_type(value, inner, label)?,
        Type::Union(members) => members
            .iter()
            .any(|member| check_type(value, member, label).is_ok()),
        Type::List(inner) => match value.as_array() {
            Some(items) => {
                for (index, item) in items.iter().enumerate() {
                    check_type(item, inner, &format!("{}[{}]", label, index))?;
                }
                true
            }
            None => false,
        },
        Type::Dict(key_type, value_type) => match value.as_object() {
            Some(entries) => {
                for (key, item) in entries {
                    let label = format!("{}[{}]", label, key);
                    check_type(&Value::String(key.clone()), key_type, &label)?;
                    check_type(item, value_type, &label)?;
                }
                true
            }
            None => false,
        },
    };

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::{check_type, validate};
    use crate::{action::Param, types::Type, Error};
    use serde_json::{json, Value};

    fn params() -> Vec<Param> {
        vec![
            Param::new("a", Type::Int),
            Param::new("b", Type::Str),
            Param::new("c", Type::Int).with_default(3),
            Param::new("d", Type::Str).with_default("foo"),
            Param::new("e", Type::optional(Type::Str)).with_default(Value::Null),
        ]
    }

    fn message(result: Result<Vec<Value>, Error>) -> String {
        result.unwrap_err().to_string()
    }

    #[test]
    fn test_binding() {
        let values = validate(&params(), &json!({"args": [1, "x"], "kwargs": {}})).unwrap();
        assert_eq!(values, vec![json!(1), json!("x"), json!(3), json!("foo"), Value::Null]);

        let values = validate(
            &params(),
            &json!({"args": [1], "kwargs": {"b": "y", "e": "bar", "c": 5}}),
        )
        .unwrap();
        assert_eq!(values, vec![json!(1), json!("y"), json!(5), json!("foo"), json!("bar")]);
    }

    #[test]
    fn test_invalid_format() {
        for payload in [
            json!([]),
            json!({"args": []}),
            json!({"kwargs": {}}),
            json!({"args": {}, "kwargs": {}}),
            json!({"args": [], "kwargs": []}),
            json!({"args": [], "kwargs": {}, "extra": 1}),
        ] {
            assert_eq!(message(validate(&params(), &payload)), "Invalid arguments format");
        }
    }

    #[test]
    fn test_argument_counts() {
        let params = params();

        let too_many = json!({"args": [1, "x", 3, "y", null, 6], "kwargs": {}});
        assert_eq!(message(validate(&params, &too_many)), "Too many arguments");

        let missing = json!({"args": [1], "kwargs": {}});
        assert_eq!(message(validate(&params, &missing)), "Argument not provided: b");

        let duplicate = json!({"args": [1, "x"], "kwargs": {"a": 2}});
        assert_eq!(message(validate(&params, &duplicate)), "Duplicate argument: a");

        let unknown = json!({"args": [1, "x"], "kwargs": {"x": 1}});
        assert_eq!(message(validate(&params, &unknown)), "Unknown argument: x");
    }

    #[test]
    fn test_positional_and_keyword_mix() {
        let params = vec![
            Param::new("a", Type::Int),
            Param::new("b", Type::Str),
            Param::new("c", Type::Int).with_default(3),
        ];

        assert_eq!(
            message(validate(&params, &json!({"args": [1], "kwargs": {}}))),
            "Argument not provided: b"
        );
        assert_eq!(
            validate(&params, &json!({"args": [1, "x"], "kwargs": {"c": 3}})).unwrap(),
            vec![json!(1), json!("x"), json!(3)]
        );
        assert_eq!(
            message(validate(&params, &json!({"args": [1, "x", 3], "kwargs": {"c": 4}}))),
            "Duplicate argument: c"
        );
        assert_eq!(
            message(validate(&params, &json!({"args": [1, "x", 3, 4, 5], "kwargs": {}}))),
            "Too many arguments"
        );

        let flag = vec![Param::new("enabled", Type::Bool)];
        assert_eq!(
            message(validate(&flag, &json!({"args": [1], "kwargs": {}}))),
            "Expected type bool for arg #0"
        );
    }

    #[test]
    fn test_too_many_with_keywords() {
        let params = vec![Param::new("a", Type::Int), Param::new("b", Type::Int)];
        let payload = json!({"args": [1, 2], "kwargs": {"c": 3}});
        assert_eq!(message(validate(&params, &payload)), "Too many arguments");
    }

    #[test]
    fn test_bool_is_not_int() {
        let params = params();

        let payload = json!({"args": [true, "x"], "kwargs": {}});
        let err = validate(&params, &payload).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
        assert_eq!(err.to_string(), "Expected type int for arg #0");

        let payload = json!({"args": [1, "x"], "kwargs": {"c": "3"}});
        assert_eq!(message(validate(&params, &payload)), "Expected type int for arg c");
    }

    #[test]
    fn test_optional_and_union() {
        let params = params();
        let payload = json!({"args": [1, "x"], "kwargs": {"e": 5}});
        assert_eq!(
            message(validate(&params, &payload)),
            "Expected type str | None for arg e"
        );

        let ty = Type::union([Type::Int, Type::Str]);
        assert!(check_type(&json!(1), &ty, "arg #0").is_ok());
        assert!(check_type(&json!("1"), &ty, "arg #0").is_ok());
        assert_eq!(
            check_type(&json!(1.5), &ty, "arg #0").unwrap_err().to_string(),
            "Expected type int | str for arg #0"
        );
    }

    #[test]
    fn test_numbers() {
        assert!(check_type(&json!(1.5), &Type::Float, "arg x").is_ok());
        assert!(check_type(&json!(1), &Type::Float, "arg x").is_err());
        assert!(check_type(&json!(u64::MAX), &Type::Int, "arg x").is_ok());
        assert!(check_type(&json!(-1), &Type::Int, "arg x").is_ok());
        assert!(check_type(&json!(false), &Type::Bool, "arg x").is_ok());
        assert!(check_type(&json!(0), &Type::Bool, "arg x").is_err());
    }

    #[test]
    fn test_containers() {
        let list = Type::list(Type::Str);
        assert!(check_type(&json!([]), &list, "arg x").is_ok());
        assert!(check_type(&json!(["a", "b"]), &list, "arg x").is_ok());
        assert_eq!(
            check_type(&json!(["a", 2]), &list, "arg x").unwrap_err().to_string(),
            "Expected type str for arg x[1]"
        );
        assert!(check_type(&json!({"a": "b"}), &list, "arg x").is_err());

        let dict = Type::dict(Type::Str, Type::list(Type::Int));
        assert!(check_type(&json!({"a": [1, 2]}), &dict, "arg x").is_ok());
        assert_eq!(
            check_type(&json!({"a": [1, "2"]}), &dict, "arg x")
                .unwrap_err()
                .to_string(),
            "Expected type int for arg x[a][1]"
        );

        let dict = Type::dict(Type::Int, Type::Any);
        assert_eq!(
            check_type(&json!({"a": 1}), &dict, "arg x").unwrap_err().to_string(),
            "Expected type int for arg x[a]"
        );

        let untyped = Type::list(Type::Any);
        assert!(check_type(&json!([1, "a", null, {}]), &untyped, "arg x").is_ok());
    }

    #[test]
    fn test_no_parameters() {
        assert!(validate(&[], &json!({"args": [], "kwargs": {}}))
            .unwrap()
            .is_empty());
        assert_eq!(
            message(validate(&[], &json!({"args": [1], "kwargs": {}}))),
            "Too many arguments"
        );
    }
}
