//
// adapt.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Upgrades messages from kernels that speak version 4 of the messaging
//! protocol so the rest of the client only ever sees version 5 messages.

use kwshared::jupyter_message::JupyterMessageHeader;
use kwshared::protocol_version::{ProtocolVersion, PROTOCOL_VERSION};
use serde_json::{json, Map, Value};

/// Adapt an inbound message in place. Messages declaring protocol version 5 or
/// later are left untouched.
pub fn adapt_inbound(header: &mut JupyterMessageHeader, content: &mut Value) {
    let version = ProtocolVersion::from_header(&header.version);
    if version.major >= 5 {
        return;
    }

    log::trace!(
        "Adapting {} message {} from protocol {} to {}",
        header.msg_type,
        header.msg_id,
        version,
        PROTOCOL_VERSION
    );

    if let Some(renamed) = renamed_type(&header.msg_type) {
        header.msg_type = renamed.to_string();
    }
    header.version = String::from(PROTOCOL_VERSION);

    let Value::Object(fields) = content else {
        return;
    };
    match header.msg_type.as_str() {
        "stream" => rename_field(fields, "data", "text"),
        "execute_result" | "display_data" => {
            fields.remove("source");
        }
        "execute_reply" => upgrade_execute_reply(fields),
        "complete_request" => upgrade_complete_request(fields),
        "complete_reply" => upgrade_complete_reply(fields),
        "inspect_request" => upgrade_inspect_request(fields),
        "inspect_reply" => upgrade_inspect_reply(fields),
        "kernel_info_reply" => upgrade_kernel_info_reply(fields),
        "input_request" => {
            fields.entry("password").or_insert(Value::Bool(false));
        }
        _ => {}
    }
}

fn renamed_type(msg_type: &str) -> Option<&'static str> {
    match msg_type {
        "pyin" => Some("execute_input"),
        "pyout" => Some("execute_result"),
        "pyerr" => Some("error"),
        "object_info_request" => Some("inspect_request"),
        "object_info_reply" => Some("inspect_reply"),
        _ => None,
    }
}

fn rename_field(fields: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = fields.remove(from) {
        fields.insert(to.to_string(), value);
    }
}

fn upgrade_execute_reply(fields: &mut Map<String, Value>) {
    // Version 4 evaluated `user_variables` separately; version 5 folds them
    // into `user_expressions`.
    let Some(Value::Object(variables)) = fields.remove("user_variables") else {
        return;
    };
    let expressions = fields
        .entry("user_expressions")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(expressions) = expressions {
        for (name, value) in variables {
            expressions.entry(name).or_insert(value);
        }
    }
}

fn upgrade_complete_request(fields: &mut Map<String, Value>) {
    let code = fields
        .remove("line")
        .or_else(|| fields.remove("block"))
        .unwrap_or(Value::String(String::new()));
    let cursor_pos = fields
        .get("cursor_pos")
        .cloned()
        .unwrap_or_else(|| json!(code.as_str().map(|s| s.chars().count()).unwrap_or(0)));
    fields.remove("text");
    fields.insert(String::from("code"), code);
    fields.insert(String::from("cursor_pos"), cursor_pos);
}

fn upgrade_complete_reply(fields: &mut Map<String, Value>) {
    // Version 4 replies only report the text being completed; express it as a
    // start offset relative to the cursor, with a null end meaning "at the
    // cursor".
    let matched = fields
        .remove("matched_text")
        .and_then(|text| text.as_str().map(|s| s.chars().count()))
        .unwrap_or(0);
    let cursor_start = if matched > 0 {
        json!(-(matched as i64))
    } else {
        Value::Null
    };
    fields.insert(String::from("cursor_start"), cursor_start);
    fields.insert(String::from("cursor_end"), Value::Null);
    fields
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    fields
        .entry("status")
        .or_insert_with(|| Value::String(String::from("ok")));
}

fn upgrade_inspect_request(fields: &mut Map<String, Value>) {
    if let Some(name) = fields.remove("oname") {
        let cursor_pos = name.as_str().map(|s| s.chars().count()).unwrap_or(0);
        fields.insert(String::from("code"), name);
        fields.insert(String::from("cursor_pos"), json!(cursor_pos));
    }
}

fn upgrade_inspect_reply(fields: &mut Map<String, Value>) {
    let found = fields
        .get("found")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut data = Map::new();
    if found {
        let mut lines: Vec<String> = Vec::new();
        for group in [
            ["call_def", "init_definition", "definition"],
            ["call_docstring", "init_docstring", "docstring"],
        ] {
            if let Some(text) = group
                .iter()
                .filter_map(|key| fields.get(*key).and_then(Value::as_str))
                .find(|text| !text.is_empty())
            {
                lines.push(text.to_string());
            }
        }
        if lines.is_empty() {
            lines.push(String::from("<empty docstring>"));
        }
        data.insert(String::from("text/plain"), Value::String(lines.join("\n")));
    }

    fields.clear();
    fields.insert(String::from("status"), Value::String(String::from("ok")));
    fields.insert(String::from("found"), Value::Bool(found));
    fields.insert(String::from("data"), Value::Object(data));
    fields.insert(String::from("metadata"), Value::Object(Map::new()));
}

fn upgrade_kernel_info_reply(fields: &mut Map<String, Value>) {
    if let Some(Value::Array(parts)) = fields.get("protocol_version") {
        let joined = join_version(parts);
        fields.insert(String::from("protocol_version"), Value::String(joined));
    }

    if !fields.contains_key("language_info") {
        let name = fields.remove("language").unwrap_or(Value::String(String::new()));
        let version = match fields.remove("language_version") {
            Some(Value::Array(parts)) => Value::String(join_version(&parts)),
            Some(other) => other,
            None => Value::String(String::new()),
        };
        fields.insert(
            String::from("language_info"),
            json!({ "name": name, "version": version }),
        );
    }

    fields
        .entry("status")
        .or_insert_with(|| Value::String(String::from("ok")));
    fields
        .entry("banner")
        .or_insert_with(|| Value::String(String::new()));
}

fn join_version(parts: &[Value]) -> String {
    parts
        .iter()
        .map(|part| match part {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(".")
}
