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

//! Rotating API-token pool for the source host.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use packscore_common::{AnalyzerErrorKind, AnalyzerResult};
use tracing::{debug, warn};

struct TokenState {
    token: String,
    exhausted_until: Option<DateTime<Utc>>,
}

/// Deals tokens round-robin style, skipping the ones whose rate limit is
/// exhausted. With an empty pool every request goes out anonymous.
pub struct TokenDealer {
    tokens: Mutex<Vec<TokenState>>,
    wait_for_reset: bool,
}

impl TokenDealer {
    pub fn new(tokens: Vec<String>, wait_for_reset: bool) -> Self {
        let token_states = tokens
            .into_iter()
            .map(|token| TokenState {
                token,
                exhausted_until: None,
            })
            .collect();
        Self {
            tokens: Mutex::new(token_states),
            wait_for_reset,
        }
    }

    /// Hands out a usable token, `None` when the pool is empty. When every
    /// token is exhausted, either waits for the earliest reset or fails
    /// transient.
    pub async fn deal(&self) -> AnalyzerResult<Option<String>> {
        loop {
            let wait_until = {
                let mut tokens = self.tokens.lock().unwrap();
                if tokens.is_empty() {
                    return Ok(None);
                }
                let now = Utc::now();
                let usable = tokens.iter_mut().find(|state| {
                    state
                        .exhausted_until
                        .map(|reset_at| reset_at <= now)
                        .unwrap_or(true)
                });
                if let Some(state) = usable {
                    state.exhausted_until = None;
                    return Ok(Some(state.token.clone()));
                }
                tokens
                    .iter()
                    .filter_map(|state| state.exhausted_until)
                    .min()
                    .expect("every token is exhausted, so every token has a reset time")
            };
            if !self.wait_for_reset {
                return Err(AnalyzerErrorKind::Transient.with_error(anyhow::anyhow!(
                    "all source-host tokens are rate-limit exhausted until {wait_until}"
                )));
            }
            let wait = (wait_until - Utc::now()).to_std().unwrap_or_default();
            warn!(reset_at = %wait_until, "token pool exhausted, waiting for rate-limit reset");
            tokio::time::sleep(wait).await;
        }
    }

    /// Marks `token` exhausted until `reset_at`. Called when the source host
    /// answers with a zero rate-limit remainder.
    pub fn exhaust(&self, token: &str, reset_at: DateTime<Utc>) {
        let mut tokens = self.tokens.lock().unwrap();
        if let Some(state) = tokens.iter_mut().find(|state| state.token == token) {
            debug!(reset_at = %reset_at, "rotating exhausted token");
            state.exhausted_until = Some(reset_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn test_empty_pool_deals_anonymous() {
        let dealer = TokenDealer::new(Vec::new(), false);
        assert_eq!(dealer.deal().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rotates_past_exhausted_tokens() {
        let dealer = TokenDealer::new(vec!["tok-a".to_string(), "tok-b".to_string()], false);
        assert_eq!(dealer.deal().await.unwrap(), Some("tok-a".to_string()));
        dealer.exhaust("tok-a", Utc::now() + Duration::hours(1));
        assert_eq!(dealer.deal().await.unwrap(), Some("tok-b".to_string()));
    }

    #[tokio::test]
    async fn test_all_exhausted_without_waiting_is_transient() {
        let dealer = TokenDealer::new(vec!["tok-a".to_string()], false);
        dealer.exhaust("tok-a", Utc::now() + Duration::hours(1));
        let error = dealer.deal().await.unwrap_err();
        assert_eq!(error.kind(), AnalyzerErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_past_reset_times_clear() {
        let dealer = TokenDealer::new(vec!["tok-a".to_string()], false);
        dealer.exhaust("tok-a", Utc::now() - Duration::seconds(1));
        assert_eq!(dealer.deal().await.unwrap(), Some("tok-a".to_string()));
    }
}
