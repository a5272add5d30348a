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

mod error;
pub mod exec;
pub mod fs;
mod kill_switch;
pub mod metrics;
pub mod retry;

use std::fmt::Debug;
use std::str::FromStr;

pub use error::{AnalyzerError, AnalyzerErrorKind, AnalyzerResult};
pub use kill_switch::KillSwitch;
use tracing::{error, info};

/// Reads a value from the environment, falling back to `default_value` when
/// the variable is absent or unparseable.
pub fn get_from_env<T: FromStr + Debug>(key: &str, default_value: T) -> T {
    if let Ok(value_str) = std::env::var(key) {
        if let Ok(value) = T::from_str(&value_str) {
            info!(value=?value, "setting `{}` from environment", key);
            return value;
        } else {
            error!(value_str=%value_str, "failed to parse `{}` from environment", key);
        }
    }
    default_value
}

/// For use with the `skip_serializing_if` serde attribute.
pub fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_get_from_env() {
        const TEST_KEY: &str = "PACKSCORE_TEST_KEY";
        assert_eq!(super::get_from_env(TEST_KEY, 10), 10);
        std::env::set_var(TEST_KEY, "15");
        assert_eq!(super::get_from_env(TEST_KEY, 10), 15);
        std::env::set_var(TEST_KEY, "notanumber");
        assert_eq!(super::get_from_env(TEST_KEY, 10), 10);
    }
}
