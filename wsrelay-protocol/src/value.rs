// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, bail};
use serde_json::Value as JsonValue;

/// The shape of an application payload once it has passed through the
/// codec boundary.
///
/// We don't just reuse `serde_json::Value` directly because event payloads
/// can carry raw binary attachments (`Bytes`), and because we need to walk
/// the tree looking for placeholder markers during attachment reassembly.
/// Keeping our own recursive enum gives us a single place to do both.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_placeholder(&self) -> Option<usize> {
        let Value::Map(m) = self else { return None };
        let is_ph = matches!(m.get("_placeholder"), Some(Value::Bool(true)));
        if !is_ph {
            return None;
        }
        match m.get("num") {
            Some(Value::Number(n)) => Some(*n as usize),
            _ => None,
        }
    }

    pub fn placeholder(num: usize) -> Value {
        let mut m = BTreeMap::new();
        m.insert("_placeholder".to_string(), Value::Bool(true));
        m.insert("num".to_string(), Value::Number(num as f64));
        Value::Map(m)
    }

    /// Walks the value tree, replacing every `Bytes` leaf with a placeholder
    /// object and appending the raw bytes to `out` in traversal order.
    ///
    /// Returns an error if the tree is implausibly deep, which is the only
    /// way a purely-owned recursive value like this one can loop forever.
    pub fn detach_binary(&self, out: &mut Vec<Vec<u8>>) -> anyhow::Result<Value> {
        self.detach_binary_depth(out, 0)
    }

    fn detach_binary_depth(&self, out: &mut Vec<Vec<u8>>, depth: usize) -> anyhow::Result<Value> {
        if depth > MAX_VALUE_DEPTH {
            bail!("value nested past the depth limit of {}", MAX_VALUE_DEPTH);
        }
        Ok(match self {
            Value::Bytes(b) => {
                let num = out.len();
                out.push(b.clone());
                Value::placeholder(num)
            }
            Value::List(items) => Value::List(
                items
                    .iter()
                    .map(|v| v.detach_binary_depth(out, depth + 1))
                    .collect::<anyhow::Result<Vec<_>>>()?,
            ),
            Value::Map(m) => Value::Map(
                m.iter()
                    .map(|(k, v)| Ok((k.clone(), v.detach_binary_depth(out, depth + 1)?)))
                    .collect::<anyhow::Result<BTreeMap<_, _>>>()?,
            ),
            other => other.clone(),
        })
    }

    /// The inverse of `detach_binary`: walks the tree replacing placeholder
    /// objects with the attachment bytes at the matching index.
    pub fn reattach_binary(&self, attachments: &[Vec<u8>]) -> anyhow::Result<Value> {
        if let Some(num) = self.is_placeholder() {
            let buf = attachments
                .get(num)
                .ok_or_else(|| anyhow!("attachment index {} out of range", num))?;
            return Ok(Value::Bytes(buf.clone()));
        }
        Ok(match self {
            Value::List(items) => Value::List(
                items
                    .iter()
                    .map(|v| v.reattach_binary(attachments))
                    .collect::<anyhow::Result<Vec<_>>>()?,
            ),
            Value::Map(m) => Value::Map(
                m.iter()
                    .map(|(k, v)| Ok((k.clone(), v.reattach_binary(attachments)?)))
                    .collect::<anyhow::Result<BTreeMap<_, _>>>()?,
            ),
            other => other.clone(),
        })
    }

    pub fn has_binary(&self) -> bool {
        match self {
            Value::Bytes(_) => true,
            Value::List(items) => items.iter().any(Value::has_binary),
            Value::Map(m) => m.values().any(Value::has_binary),
            _ => false,
        }
    }

    pub fn from_json(v: JsonValue) -> Value {
        match v {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::List(items.into_iter().map(Value::from_json).collect()),
            JsonValue::Object(m) => {
                Value::Map(m.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())
            }
        }
    }

    /// Converts to `serde_json::Value`, dropping raw `Bytes` leaves that
    /// were never detached (callers should detach first; this is only used
    /// once a value is known to be attachment-free).
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Bytes(_) => JsonValue::Null,
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(m) => {
                JsonValue::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }
}

const MAX_VALUE_DEPTH: usize = 128;

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detach_reattach_round_trip() {
        let mut m = BTreeMap::new();
        m.insert("img".to_string(), Value::Bytes(vec![1, 2, 3]));
        m.insert("name".to_string(), Value::String("frame".to_string()));
        let v = Value::List(vec![Value::Map(m), Value::Bytes(vec![9, 9])]);

        let mut attachments = Vec::new();
        let detached = v.detach_binary(&mut attachments).unwrap();
        assert!(!detached.has_binary());
        assert_eq!(attachments.len(), 2);

        let reattached = detached.reattach_binary(&attachments).unwrap();
        assert_eq!(reattached, v);
    }

    #[test]
    fn reattach_missing_index_errors() {
        let v = Value::placeholder(3);
        assert!(v.reattach_binary(&[]).is_err());
    }
}
