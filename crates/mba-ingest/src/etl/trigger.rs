//! Load triggers
//!
//! A trigger names one object to load. It arrives either as a direct JSON
//! document `{"source": "<bucket>", "key": "<key>", "table": "<optional>"}`
//! or as an S3 event notification, which is expanded to one trigger per
//! record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::loader::{CsvLoader, LoadOutcome};
use crate::error::{EtlError, EtlResult};

pub const TABULAR_SEGMENT: &str = "tabular";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadTrigger {
    pub source: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl LoadTrigger {
    pub fn new(source: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            key: key.into(),
            table: None,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn from_json(json: &str) -> EtlResult<Self> {
        let trigger: LoadTrigger = serde_json::from_str(json)
            .map_err(|e| EtlError::InvalidTrigger(format!("malformed trigger: {e}")))?;
        trigger.check()?;
        Ok(trigger)
    }

    fn check(&self) -> EtlResult<()> {
        if self.source.trim().is_empty() {
            return Err(EtlError::InvalidTrigger("source is empty".to_string()));
        }
        if self.key.trim().is_empty() {
            return Err(EtlError::InvalidTrigger("key is empty".to_string()));
        }
        Ok(())
    }
}

/// Whether a key has the `<scope>/tabular/<name>.csv` shape the loader accepts
pub fn is_loadable_key(key: &str) -> bool {
    let mut parts = key.splitn(3, '/');
    let (Some(scope), Some(category), Some(name)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    !scope.is_empty()
        && category == TABULAR_SEGMENT
        && !name.is_empty()
        && name.to_ascii_lowercase().ends_with(".csv")
}

/// Decode an S3 event key: `+` is a space and the rest is percent-encoded
fn decode_event_key(raw: &str) -> EtlResult<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|key| key.into_owned())
        .map_err(|e| EtlError::InvalidTrigger(format!("undecodable key {raw:?}: {e}")))
}

/// Parse a trigger document into triggers.
///
/// Direct triggers are returned as is. For S3 event notifications, records
/// whose key is not loadable are skipped.
pub fn triggers_from_event(json: &str) -> EtlResult<Vec<LoadTrigger>> {
    let document: Value = serde_json::from_str(json)
        .map_err(|e| EtlError::InvalidTrigger(format!("malformed trigger: {e}")))?;

    let Some(records) = document.get("Records") else {
        return Ok(vec![LoadTrigger::from_json(json)?]);
    };
    let records = records
        .as_array()
        .ok_or_else(|| EtlError::InvalidTrigger("Records is not an array".to_string()))?;

    let mut triggers = Vec::new();
    for (index, record) in records.iter().enumerate() {
        let bucket = record
            .pointer("/s3/bucket/name")
            .and_then(Value::as_str)
            .ok_or_else(|| EtlError::InvalidTrigger(format!("record {index} has no bucket name")))?;
        let raw_key = record
            .pointer("/s3/object/key")
            .and_then(Value::as_str)
            .ok_or_else(|| EtlError::InvalidTrigger(format!("record {index} has no object key")))?;

        let key = decode_event_key(raw_key)?;
        if !is_loadable_key(&key) {
            info!(key = %key, "Skipping event record outside tabular CSV prefix");
            continue;
        }
        triggers.push(LoadTrigger::new(bucket, key));
    }
    Ok(triggers)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchResult {
    Loaded(LoadOutcome),
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchEntry {
    pub trigger: LoadTrigger,
    #[serde(flatten)]
    pub result: DispatchResult,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchSummary {
    pub entries: Vec<DispatchEntry>,
}

impl DispatchSummary {
    pub fn loaded(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.result, DispatchResult::Loaded(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.entries.len() - self.loaded()
    }

    pub fn rows_inserted(&self) -> u64 {
        self.entries
            .iter()
            .filter_map(|e| match &e.result {
                DispatchResult::Loaded(outcome) => Some(outcome.rows_inserted),
                DispatchResult::Failed { .. } => None,
            })
            .sum()
    }
}

/// Runs each trigger through the loader independently
pub struct LoadDispatcher<'a> {
    loader: &'a CsvLoader,
}

impl<'a> LoadDispatcher<'a> {
    pub fn new(loader: &'a CsvLoader) -> Self {
        Self { loader }
    }

    pub async fn dispatch(&self, triggers: &[LoadTrigger]) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        for trigger in triggers {
            let result = match self.loader.load(trigger).await {
                Ok(outcome) => DispatchResult::Loaded(outcome),
                Err(e) => {
                    warn!(key = %trigger.key, error = %e, "Load failed");
                    DispatchResult::Failed {
                        error: e.to_string(),
                    }
                },
            };
            summary.entries.push(DispatchEntry {
                trigger: trigger.clone(),
                result,
            });
        }
        summary
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_trigger() {
        let trigger =
            LoadTrigger::from_json(r#"{"source": "mba-data", "key": "a/tabular/x.csv"}"#).unwrap();
        assert_eq!(trigger, LoadTrigger::new("mba-data", "a/tabular/x.csv"));

        let with_table = LoadTrigger::from_json(
            r#"{"source": "mba-data", "key": "a/tabular/x.csv", "table": "sales"}"#,
        )
        .unwrap();
        assert_eq!(with_table.table.as_deref(), Some("sales"));
    }

    #[test]
    fn test_trigger_rejects_unknown_and_missing_fields() {
        assert!(matches!(
            LoadTrigger::from_json(r#"{"source": "b", "key": "k", "extra": 1}"#),
            Err(EtlError::InvalidTrigger(_))
        ));
        assert!(LoadTrigger::from_json(r#"{"source": "b"}"#).is_err());
        assert!(LoadTrigger::from_json(r#"{"source": "", "key": "k"}"#).is_err());
        assert!(LoadTrigger::from_json("not json").is_err());
    }

    #[test]
    fn test_loadable_keys() {
        assert!(is_loadable_key("mba/tabular/sales.csv"));
        assert!(is_loadable_key("mba/tabular/nested/Sales.CSV"));
        assert!(!is_loadable_key("mba/documents/sales.csv"));
        assert!(!is_loadable_key("mba/tabular/sales.xlsx"));
        assert!(!is_loadable_key("tabular/sales.csv"));
        assert!(!is_loadable_key("/tabular/sales.csv"));
    }

    #[test]
    fn test_event_records_are_decoded_and_filtered() {
        let event = r#"{
            "Records": [
                {"s3": {"bucket": {"name": "mba-data"}, "object": {"key": "mba/tabular/q1+sales%2C2024.csv"}}},
                {"s3": {"bucket": {"name": "mba-data"}, "object": {"key": "mba/documents/readme.pdf"}}}
            ]
        }"#;
        let triggers = triggers_from_event(event).unwrap();
        assert_eq!(triggers, vec![LoadTrigger::new("mba-data", "mba/tabular/q1 sales,2024.csv")]);
    }

    #[test]
    fn test_event_falls_back_to_direct_trigger() {
        let triggers = triggers_from_event(r#"{"source": "b", "key": "s/tabular/x.csv"}"#).unwrap();
        assert_eq!(triggers.len(), 1);
        assert!(triggers_from_event(r#"{"Records": [{"s3": {}}]}"#).is_err());
    }
}
