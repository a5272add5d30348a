// Copyright (C) 2024 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use serde_json::Value as JsonValue;

/// Drops empty leaves before persistence: `null`, `""`, `[]` and `{}`
/// disappear, recursively. `false` and `0` are data and survive.
pub fn compact_json(value: JsonValue) -> Option<JsonValue> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(string) if string.is_empty() => None,
        JsonValue::Array(items) => {
            let compacted: Vec<JsonValue> =
                items.into_iter().filter_map(compact_json).collect();
            if compacted.is_empty() {
                None
            } else {
                Some(JsonValue::Array(compacted))
            }
        }
        JsonValue::Object(entries) => {
            let compacted: serde_json::Map<String, JsonValue> = entries
                .into_iter()
                .filter_map(|(key, entry_value)| {
                    compact_json(entry_value).map(|compacted_value| (key, compacted_value))
                })
                .collect();
            if compacted.is_empty() {
                None
            } else {
                Some(JsonValue::Object(compacted))
            }
        }
        other => Some(other),
    }
}
