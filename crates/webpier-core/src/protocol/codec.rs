//! Wire codec for control messages.
//!
//! Strict reader: the action must be known and at most one payload field may
//! be present. Records are accepted only as JSON objects, never as the
//! positional arrays serde would otherwise take, and bulk payloads must be
//! either an object or an array of objects.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::types::{Action, Message, Payload, Report};
use crate::error::{Error, Result};

const PAYLOAD_FIELDS: [&str; 4] = ["error", "handle", "health", "report"];

/// Encode a message as one newline-terminated JSON object.
pub fn encode(message: &Message) -> Result<String> {
    let mut object = Map::new();
    object.insert("action".into(), Value::from(u64::from(message.action)));

    match &message.payload {
        Payload::Empty => {}
        Payload::Error(text) => {
            object.insert("error".into(), Value::from(text.as_str()));
        }
        Payload::Handle(handle) => {
            object.insert("handle".into(), serde_json::to_value(handle)?);
        }
        Payload::Health(health) => {
            object.insert("health".into(), serde_json::to_value(health)?);
        }
        Payload::HealthList(list) => {
            object.insert("health".into(), serde_json::to_value(list)?);
        }
        Payload::Report(report) => {
            object.insert("report".into(), serde_json::to_value(report)?);
        }
        Payload::ReportList(list) => {
            object.insert("report".into(), serde_json::to_value(list)?);
        }
    }

    let mut line = Value::Object(object).to_string();
    line.push('\n');
    Ok(line)
}

/// Decode a single JSON line into a message.
pub fn decode(line: &str) -> Result<Message> {
    let raw: Value = serde_json::from_str(line.trim_end())?;
    let Value::Object(mut object) = raw else {
        return Err(Error::Protocol("Message is not a JSON object".into()));
    };

    let action = object
        .get("action")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Protocol("Missing 'action' field".into()))?;
    let action = Action::try_from(action)?;

    let mut present = PAYLOAD_FIELDS
        .iter()
        .copied()
        .filter(|field| object.contains_key(*field));
    let field = match (present.next(), present.next()) {
        (None, _) => return Ok(Message::request(action)),
        (Some(first), Some(second)) => {
            return Err(Error::Protocol(format!(
                "Ambiguous payload: both '{first}' and '{second}' present"
            )));
        }
        (Some(field), None) => field,
    };
    let value = object.remove(field).unwrap_or(Value::Null);

    let payload = match field {
        "error" => match value {
            Value::String(text) => Payload::Error(text),
            _ => return Err(Error::Protocol("'error' must be a string".into())),
        },
        "handle" => match value {
            value @ Value::Object(_) => Payload::Handle(serde_json::from_value(value)?),
            _ => return Err(Error::Protocol("'handle' must be an object".into())),
        },
        "health" => match value {
            Value::Array(items) => Payload::HealthList(decode_list(items)?),
            value @ Value::Object(_) => Payload::Health(serde_json::from_value(value)?),
            _ => return Err(Error::Protocol("'health' must be an object or array".into())),
        },
        _ => match value {
            Value::Array(items) => Payload::ReportList(
                items
                    .into_iter()
                    .map(decode_report)
                    .collect::<Result<_>>()?,
            ),
            value @ Value::Object(_) => Payload::Report(decode_report(value)?),
            _ => return Err(Error::Protocol("'report' must be an object or array".into())),
        },
    };

    Ok(Message::new(action, payload))
}

fn decode_list<T: DeserializeOwned>(items: Vec<Value>) -> Result<Vec<T>> {
    items
        .into_iter()
        .map(|item| {
            if item.is_object() {
                Ok(serde_json::from_value(item)?)
            } else {
                Err(Error::Protocol("List items must be objects".into()))
            }
        })
        .collect()
}

fn decode_report(value: Value) -> Result<Report> {
    let Value::Object(object) = &value else {
        return Err(Error::Protocol("List items must be objects".into()));
    };
    match object.get("tunnels") {
        None => {}
        Some(Value::Array(tunnels)) if tunnels.iter().all(Value::is_object) => {}
        Some(_) => {
            return Err(Error::Protocol(
                "'tunnels' must be an array of objects".into(),
            ));
        }
    }
    Ok(serde_json::from_value(value)?)
}
