use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    classifier::Classification,
    connection::{ConnectionState, ConnectionStatus},
    db::models::{HistoryEntry, House, Status},
    history::HistoryFilter,
    thresholds::ThresholdConfig,
};

// ---------------------------------------------------------------------------
// Houses
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HouseNameRequest {
    /// 1 to 50 characters after trimming, unique ignoring case.
    pub name: String,
}

/// Everything a house dashboard shows.
#[derive(Debug, Serialize, ToSchema)]
pub struct DashboardDto {
    pub house: House,
    pub thresholds: ThresholdConfig,
    /// Latest cached values classified against the current thresholds.
    pub statuses: Classification,
    /// Newest first.
    pub recent: Vec<HistoryEntry>,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct HistoryParams {
    #[serde(alias = "house_id")]
    pub house_id: Option<String>,
    /// `Normal`, `Perlu Diperiksa` or `Penuh` (also `normal`, `needs_check`, `full`).
    #[param(value_type = Option<String>)]
    pub status: Option<Status>,
    /// First day included (YYYY-MM-DD).
    pub from: Option<NaiveDate>,
    /// Last day included (YYYY-MM-DD).
    pub to: Option<NaiveDate>,
}

impl From<HistoryParams> for HistoryFilter {
    fn from(p: HistoryParams) -> Self {
        Self {
            house_id: p.house_id.filter(|id| !id.is_empty()),
            status: p.status,
            from: p.from,
            to: p.to,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NextRetryDto {
    pub attempt: u32,
    pub delay_secs: u64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDto {
    pub status: ConnectionStatus,
    /// Human-readable summary, e.g. "Reconnecting attempt 3 in 8s".
    pub status_text: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub next_retry: Option<NextRetryDto>,
}

impl From<ConnectionState> for ConnectionDto {
    fn from(s: ConnectionState) -> Self {
        Self {
            status_text: s.status_text(),
            status: s.status,
            retry_count: s.retry_count,
            max_retries: s.max_retries,
            last_error: s.last_error,
            next_retry: s.next_retry.map(|r| NextRetryDto {
                attempt: r.attempt,
                delay_secs: r.delay.as_secs(),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BrokerRequest {
    pub host: String,
    pub port: u32,
}
