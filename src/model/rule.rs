//! Rule/filter model (§3, §4.8). Generalizes the teacher's `RuleFilter` enum
//! (which only modeled `TrueFilter`/`SqlFilter`/`CorrelationFilter` for the
//! management UI) into the full four-variant filter plus two-variant action
//! sum type the spec names, replacing the deep class hierarchy the original
//! client used with tagged variants (Design Note §9).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::error::{Result, ServiceBusError, ServiceBusErrorKind};
use crate::model::message::{ReceivedMessage, UserPropertyValue};

const MAX_RULE_NAME_LEN: usize = 50;
const MAX_SQL_EXPRESSION_LEN: usize = 1024;
const URI_RESERVED: &[char] = &[
    ':', '/', '?', '#', '[', ']', '@', '!', '$', '&', '\'', '(', ')', '*', '+', ',', ';', '=',
];

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Sql {
        expression: String,
        parameters: HashMap<String, UserPropertyValue>,
    },
    Correlation {
        correlation_id: Option<String>,
        message_id: Option<String>,
        to: Option<String>,
        reply_to: Option<String>,
        label: Option<String>,
        session_id: Option<String>,
        reply_to_session_id: Option<String>,
        content_type: Option<String>,
        properties: HashMap<String, UserPropertyValue>,
    },
    /// Matches all messages. Sentinel value, not a subclass (Design Note §9).
    True,
    /// Matches no messages.
    False,
}

impl Filter {
    pub fn sql(expression: impl Into<String>) -> Result<Self> {
        let expression = expression.into();
        validate_sql_expression(&expression)?;
        Ok(Self::Sql {
            expression,
            parameters: HashMap::new(),
        })
    }

    /// Declarative filters are transported, not evaluated, server-side
    /// (§4.8) — except `True`/`False`/`Correlation`, which are simple
    /// enough that client-side evaluation is useful for callers validating
    /// a filter against sample messages before registering it (§8).
    pub fn matches(&self, message: &ReceivedMessage) -> bool {
        match self {
            Filter::True => true,
            Filter::False => false,
            Filter::Sql { .. } => true, // server-evaluated only; assume match client-side
            Filter::Correlation {
                correlation_id,
                message_id,
                to,
                reply_to,
                label,
                session_id,
                reply_to_session_id,
                content_type,
                properties,
            } => {
                field_matches(correlation_id, message.message.correlation_id())
                    && field_matches(message_id, message.message.message_id())
                    && field_matches(to, message.message.to())
                    && field_matches(reply_to, message.message.reply_to())
                    && field_matches(label, message.message.label())
                    && field_matches(session_id, message.message.session_id())
                    && field_matches(
                        reply_to_session_id,
                        message.message.reply_to_session_id(),
                    )
                    && field_matches(content_type, message.message.content_type())
                    && properties
                        .iter()
                        .all(|(k, v)| message.message.properties.get(k) == Some(v))
            }
        }
    }
}

fn field_matches(expected: &Option<String>, actual: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(e) => actual == Some(e.as_str()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Sql {
        expression: String,
        parameters: HashMap<String, UserPropertyValue>,
    },
    Empty,
}

impl Action {
    pub fn sql(expression: impl Into<String>) -> Result<Self> {
        let expression = expression.into();
        validate_sql_expression(&expression)?;
        Ok(Self::Sql {
            expression,
            parameters: HashMap::new(),
        })
    }
}

fn validate_sql_expression(expression: &str) -> Result<()> {
    if expression.chars().count() > MAX_SQL_EXPRESSION_LEN {
        return Err(ServiceBusError::argument(format!(
            "SQL expression exceeds {MAX_SQL_EXPRESSION_LEN} characters"
        )));
    }
    Ok(())
}

/// `(name, filter, action)` tuple (§3). Structural equality compares `name`
/// case-insensitively and `filter`/`action` by value (§4.8).
#[derive(Debug, Clone)]
pub struct RuleDescription {
    pub name: String,
    pub filter: Filter,
    pub action: Action,
}

impl RuleDescription {
    pub fn new(name: impl Into<String>, filter: Filter, action: Action) -> Result<Self> {
        let name = name.into();
        validate_rule_name(&name)?;
        Ok(Self {
            name,
            filter,
            action,
        })
    }

    /// The rule every newly created subscription carries (§3).
    pub fn default_rule() -> Self {
        Self {
            name: "$Default".to_string(),
            filter: Filter::True,
            action: Action::Empty,
        }
    }
}

impl PartialEq for RuleDescription {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.filter == other.filter
            && self.action == other.action
    }
}

fn validate_rule_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ServiceBusError::argument("rule name must not be empty"));
    }
    if name.chars().count() > MAX_RULE_NAME_LEN {
        return Err(ServiceBusError::argument(format!(
            "rule name exceeds {MAX_RULE_NAME_LEN} characters"
        )));
    }
    if name.contains('/') || name.chars().any(|c| URI_RESERVED.contains(&c)) {
        return Err(ServiceBusError::argument(
            "rule name must not contain a path delimiter or URI-reserved characters",
        ));
    }
    Ok(())
}

/// In-memory mirror of a subscription's rule set, used by tests and by
/// callers validating `add_rule` calls before issuing them against the
/// management link (§4.8's uniqueness invariant is enforced here, but the
/// broker is the ultimate source of truth).
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<RuleDescription>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: RuleDescription) -> Result<()> {
        if self
            .rules
            .iter()
            .any(|r| r.name.eq_ignore_ascii_case(&rule.name))
        {
            return Err(ServiceBusError::argument(format!(
                "rule name '{}' already exists",
                rule.name
            )));
        }
        self.rules.push(rule);
        Ok(())
    }

    pub fn remove_rule(&mut self, name: &str) -> Result<()> {
        let before = self.rules.len();
        self.rules.retain(|r| !r.name.eq_ignore_ascii_case(name));
        if self.rules.len() == before {
            return Err(ServiceBusError::new(
                crate::error::ServiceBusErrorKind::EntityNotFound,
                format!("rule '{name}' not found"),
            ));
        }
        Ok(())
    }

    pub fn get_rules(&self) -> &[RuleDescription] {
        &self.rules
    }
}

/// Wire encoding for the custom `com.microsoft:*:list` descriptors (§6): a
/// described list whose positional fields follow §3. Correlation filter has
/// exactly 9 fields ending in a properties map; SQL filter/action have 3
/// fields (expression, a reserved compatibility-level slot, parameters map).
/// Unknown trailing fields are tolerated on decode (§6).
pub mod wire {
    use super::*;

    pub const SQL_FILTER: &str = "com.microsoft:sql-filter:list";
    pub const CORRELATION_FILTER: &str = "com.microsoft:correlation-filter:list";
    pub const TRUE_FILTER: &str = "com.microsoft:true-filter:list";
    pub const FALSE_FILTER: &str = "com.microsoft:false-filter:list";
    pub const SQL_ACTION: &str = "com.microsoft:sql-rule-action:list";
    pub const EMPTY_ACTION: &str = "com.microsoft:empty-rule-action:list";

    fn encode_value(v: &UserPropertyValue) -> Value {
        match v {
            UserPropertyValue::String(s) => json!({"type": "string", "value": s}),
            UserPropertyValue::I64(n) => json!({"type": "i64", "value": n}),
            UserPropertyValue::I32(n) => json!({"type": "i32", "value": n}),
            UserPropertyValue::F64(f) => json!({"type": "f64", "value": f}),
            UserPropertyValue::Bool(b) => json!({"type": "bool", "value": b}),
            UserPropertyValue::Timestamp(t) => json!({"type": "timestamp", "value": t.to_rfc3339()}),
        }
    }

    fn decode_value(v: &Value) -> Result<UserPropertyValue> {
        let ty = v.get("type").and_then(Value::as_str).ok_or_else(|| {
            ServiceBusError::new(ServiceBusErrorKind::InternalError, "property value missing type tag")
        })?;
        let value = v
            .get("value")
            .ok_or_else(|| ServiceBusError::new(ServiceBusErrorKind::InternalError, "property value missing value"))?;
        Ok(match ty {
            "string" => UserPropertyValue::String(value.as_str().unwrap_or_default().to_string()),
            "i64" => UserPropertyValue::I64(value.as_i64().unwrap_or_default()),
            "i32" => UserPropertyValue::I32(value.as_i64().unwrap_or_default() as i32),
            "f64" => UserPropertyValue::F64(value.as_f64().unwrap_or_default()),
            "bool" => UserPropertyValue::Bool(value.as_bool().unwrap_or_default()),
            "timestamp" => {
                let s = value.as_str().unwrap_or_default();
                let dt: DateTime<Utc> = DateTime::parse_from_rfc3339(s)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| ServiceBusError::new(ServiceBusErrorKind::InternalError, e.to_string()))?;
                UserPropertyValue::Timestamp(dt)
            }
            other => {
                return Err(ServiceBusError::new(
                    ServiceBusErrorKind::InternalError,
                    format!("unrecognized property value type '{other}'"),
                ))
            }
        })
    }

    fn encode_properties(map: &HashMap<String, UserPropertyValue>) -> Value {
        Value::Object(map.iter().map(|(k, v)| (k.clone(), encode_value(v))).collect())
    }

    fn decode_properties(value: &Value) -> Result<HashMap<String, UserPropertyValue>> {
        let Some(obj) = value.as_object() else {
            return Ok(HashMap::new());
        };
        obj.iter()
            .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
            .collect()
    }

    fn opt_str(v: &Option<String>) -> Value {
        v.clone().map(Value::String).unwrap_or(Value::Null)
    }

    fn opt_str_field(fields: &[Value], index: usize) -> Option<String> {
        fields.get(index).and_then(Value::as_str).map(str::to_string)
    }

    pub fn encode_filter(filter: &Filter) -> Value {
        match filter {
            Filter::True => json!({"descriptor": TRUE_FILTER, "fields": []}),
            Filter::False => json!({"descriptor": FALSE_FILTER, "fields": []}),
            Filter::Sql { expression, parameters } => json!({
                "descriptor": SQL_FILTER,
                "fields": [expression, Value::Null, encode_properties(parameters)],
            }),
            Filter::Correlation {
                correlation_id,
                message_id,
                to,
                reply_to,
                label,
                session_id,
                reply_to_session_id,
                content_type,
                properties,
            } => json!({
                "descriptor": CORRELATION_FILTER,
                "fields": [
                    opt_str(correlation_id),
                    opt_str(message_id),
                    opt_str(to),
                    opt_str(reply_to),
                    opt_str(label),
                    opt_str(session_id),
                    opt_str(reply_to_session_id),
                    opt_str(content_type),
                    encode_properties(properties),
                ],
            }),
        }
    }

    pub fn decode_filter(value: &Value) -> Result<Filter> {
        let descriptor = value.get("descriptor").and_then(Value::as_str).ok_or_else(|| {
            ServiceBusError::new(ServiceBusErrorKind::InternalError, "filter missing descriptor")
        })?;
        let empty = Vec::new();
        let fields = value.get("fields").and_then(Value::as_array).unwrap_or(&empty);
        Ok(match descriptor {
            TRUE_FILTER => Filter::True,
            FALSE_FILTER => Filter::False,
            SQL_FILTER => Filter::Sql {
                expression: fields.first().and_then(Value::as_str).unwrap_or_default().to_string(),
                parameters: fields.get(2).map(decode_properties).transpose()?.unwrap_or_default(),
            },
            CORRELATION_FILTER => Filter::Correlation {
                correlation_id: opt_str_field(fields, 0),
                message_id: opt_str_field(fields, 1),
                to: opt_str_field(fields, 2),
                reply_to: opt_str_field(fields, 3),
                label: opt_str_field(fields, 4),
                session_id: opt_str_field(fields, 5),
                reply_to_session_id: opt_str_field(fields, 6),
                content_type: opt_str_field(fields, 7),
                properties: fields.get(8).map(decode_properties).transpose()?.unwrap_or_default(),
            },
            other => {
                return Err(ServiceBusError::new(
                    ServiceBusErrorKind::InternalError,
                    format!("unrecognized filter descriptor '{other}'"),
                ))
            }
        })
    }

    pub fn encode_action(action: &Action) -> Value {
        match action {
            Action::Empty => json!({"descriptor": EMPTY_ACTION, "fields": []}),
            Action::Sql { expression, parameters } => json!({
                "descriptor": SQL_ACTION,
                "fields": [expression, Value::Null, encode_properties(parameters)],
            }),
        }
    }

    pub fn decode_action(value: &Value) -> Result<Action> {
        let descriptor = value.get("descriptor").and_then(Value::as_str).ok_or_else(|| {
            ServiceBusError::new(ServiceBusErrorKind::InternalError, "action missing descriptor")
        })?;
        let empty = Vec::new();
        let fields = value.get("fields").and_then(Value::as_array).unwrap_or(&empty);
        Ok(match descriptor {
            EMPTY_ACTION => Action::Empty,
            SQL_ACTION => Action::Sql {
                expression: fields.first().and_then(Value::as_str).unwrap_or_default().to_string(),
                parameters: fields.get(2).map(decode_properties).transpose()?.unwrap_or_default(),
            },
            other => {
                return Err(ServiceBusError::new(
                    ServiceBusErrorKind::InternalError,
                    format!("unrecognized action descriptor '{other}'"),
                ))
            }
        })
    }

    pub fn encode_rule_description(rule: &RuleDescription) -> Value {
        json!({
            "rule-name": rule.name,
            "filter": encode_filter(&rule.filter),
            "action": encode_action(&rule.action),
        })
    }

    pub fn decode_rule_description(value: &Value) -> Result<RuleDescription> {
        let name = value
            .get("rule-name")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceBusError::new(ServiceBusErrorKind::InternalError, "rule missing rule-name"))?
            .to_string();
        let filter = value
            .get("filter")
            .map(decode_filter)
            .transpose()?
            .unwrap_or(Filter::True);
        let action = value
            .get("action")
            .map(decode_action)
            .transpose()?
            .unwrap_or(Action::Empty);
        RuleDescription::new(name, filter, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rule_is_true_filter() {
        let rule = RuleDescription::default_rule();
        assert_eq!(rule.name, "$Default");
        assert_eq!(rule.filter, Filter::True);
    }

    #[test]
    fn rule_name_validation() {
        assert!(RuleDescription::new("", Filter::True, Action::Empty).is_err());
        assert!(RuleDescription::new("a/b", Filter::True, Action::Empty).is_err());
        assert!(RuleDescription::new("a:b", Filter::True, Action::Empty).is_err());
        assert!(RuleDescription::new("a".repeat(51), Filter::True, Action::Empty).is_err());
        assert!(RuleDescription::new("valid-name", Filter::True, Action::Empty).is_ok());
    }

    #[test]
    fn sql_expression_length_enforced() {
        assert!(Filter::sql("a".repeat(1025)).is_err());
        assert!(Filter::sql("a".repeat(1024)).is_ok());
    }

    #[test]
    fn rule_set_enforces_unique_names_case_insensitive() {
        let mut set = RuleSet::new();
        set.add_rule(RuleDescription::new("Foo", Filter::True, Action::Empty).unwrap())
            .unwrap();
        let result = set.add_rule(RuleDescription::new("foo", Filter::False, Action::Empty).unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn add_rule_then_get_rules_round_trips() {
        let mut set = RuleSet::new();
        let rule = RuleDescription::new("r1", Filter::True, Action::Empty).unwrap();
        set.add_rule(rule.clone()).unwrap();
        assert!(set.get_rules().iter().any(|r| *r == rule));
    }

    #[test]
    fn remove_rule_missing_is_not_found() {
        let mut set = RuleSet::new();
        assert!(set.remove_rule("nope").is_err());
    }

    #[test]
    fn true_filter_matches_everything_false_matches_nothing() {
        let msg = crate::testutil::received_message(b"x", None);
        assert!(Filter::True.matches(&msg));
        assert!(!Filter::False.matches(&msg));
    }

    #[test]
    fn correlation_filter_requires_every_specified_field_to_match() {
        let mut message = crate::model::message::Message::new(bytes::Bytes::from_static(b"x"));
        message.set_correlation_id(Some("abc".into()));
        let received = crate::testutil::received_message_from(message, 1);

        let matching = Filter::Correlation {
            correlation_id: Some("abc".into()),
            message_id: None,
            to: None,
            reply_to: None,
            label: None,
            session_id: None,
            reply_to_session_id: None,
            content_type: None,
            properties: HashMap::new(),
        };
        assert!(matching.matches(&received));

        let non_matching = Filter::Correlation {
            correlation_id: Some("xyz".into()),
            message_id: None,
            to: None,
            reply_to: None,
            label: None,
            session_id: None,
            reply_to_session_id: None,
            content_type: None,
            properties: HashMap::new(),
        };
        assert!(!non_matching.matches(&received));
    }

    #[test]
    fn true_and_false_filter_round_trip() {
        let encoded = wire::encode_filter(&Filter::True);
        assert_eq!(wire::decode_filter(&encoded).unwrap(), Filter::True);
        let encoded = wire::encode_filter(&Filter::False);
        assert_eq!(wire::decode_filter(&encoded).unwrap(), Filter::False);
    }

    #[test]
    fn sql_filter_round_trips_with_parameters() {
        let mut parameters = HashMap::new();
        parameters.insert("p1".to_string(), UserPropertyValue::I64(42));
        let filter = Filter::Sql {
            expression: "1=1".to_string(),
            parameters,
        };
        let encoded = wire::encode_filter(&filter);
        assert_eq!(wire::decode_filter(&encoded).unwrap(), filter);
    }

    #[test]
    fn correlation_filter_round_trips_all_nine_fields() {
        let mut properties = HashMap::new();
        properties.insert("k".to_string(), UserPropertyValue::String("v".into()));
        let filter = Filter::Correlation {
            correlation_id: Some("c1".into()),
            message_id: Some("m1".into()),
            to: Some("t1".into()),
            reply_to: Some("r1".into()),
            label: Some("l1".into()),
            session_id: Some("s1".into()),
            reply_to_session_id: Some("rs1".into()),
            content_type: Some("ct1".into()),
            properties,
        };
        let encoded = wire::encode_filter(&filter);
        assert_eq!(wire::decode_filter(&encoded).unwrap(), filter);
    }

    #[test]
    fn sql_action_round_trips() {
        let action = Action::sql("SET x = 1").unwrap();
        let encoded = wire::encode_action(&action);
        assert_eq!(wire::decode_action(&encoded).unwrap(), action);
    }

    #[test]
    fn empty_action_round_trips() {
        let encoded = wire::encode_action(&Action::Empty);
        assert_eq!(wire::decode_action(&encoded).unwrap(), Action::Empty);
    }

    #[test]
    fn rule_description_round_trips_through_wire_encoding() {
        let rule = RuleDescription::new("r1", Filter::True, Action::Empty).unwrap();
        let encoded = wire::encode_rule_description(&rule);
        let decoded = wire::decode_rule_description(&encoded).unwrap();
        assert_eq!(decoded, rule);
    }

    #[test]
    fn decode_tolerates_unknown_trailing_fields() {
        let mut encoded = wire::encode_filter(&Filter::Sql {
            expression: "1=1".to_string(),
            parameters: HashMap::new(),
        });
        encoded["fields"]
            .as_array_mut()
            .unwrap()
            .push(json!("unexpected-trailing-field"));
        assert!(wire::decode_filter(&encoded).is_ok());
    }
}
