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

use once_cell::sync::Lazy;
use packscore_common::metrics::{new_counter_vec, new_histogram_vec, HistogramVec, IntCounterVec};

pub struct AnalyzerMetrics {
    pub analyses_total: IntCounterVec<1>,
    pub analysis_duration_secs: HistogramVec<1>,
}

impl Default for AnalyzerMetrics {
    fn default() -> Self {
        AnalyzerMetrics {
            analyses_total: new_counter_vec(
                "analyses_total",
                "Number of analyses run, by outcome.",
                "packscore",
                ["outcome"],
            ),
            analysis_duration_secs: new_histogram_vec(
                "analysis_duration_secs",
                "Wall-clock duration of one analysis, by outcome.",
                "packscore",
                ["outcome"],
            ),
        }
    }
}

/// Analyzer metrics, initialized on first use.
pub static ANALYZER_METRICS: Lazy<AnalyzerMetrics> = Lazy::new(AnalyzerMetrics::default);
