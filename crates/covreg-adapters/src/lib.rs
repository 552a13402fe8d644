//! Upstream source adapters: fetch + parse the DPC province feeds.
//!
//! Two wire formats carry the same logical record: a single "latest" JSON
//! resource and one CSV resource per historical date. Both decode into the
//! same loosely-typed field bag, which [`normalize`] turns into the canonical
//! province record.

use async_trait::async_trait;
use chrono::NaiveDate;
use covreg_core::CanonicalProvinceRecord;
use covreg_storage::{HttpClientConfig, HttpError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "covreg-adapters";

pub const DEFAULT_JSON_BASE_URL: &str =
    "https://raw.githubusercontent.com/pcm-dpc/COVID-19/master/dati-json/";
pub const DEFAULT_CSV_BASE_URL: &str =
    "https://raw.githubusercontent.com/pcm-dpc/COVID-19/master/dati-province/";
pub const LATEST_FILENAME_JSON: &str = "dpc-covid19-ita-province-latest.json";

/// The upstream rejects anonymous clients, so a browser-like identity is
/// sent with every request.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// One province row as published, before any validation.
///
/// Field names are stable across formats (`data`, `codice_regione`,
/// `denominazione_regione`, `totale_casi`, ...); value types are not — JSON
/// carries numbers where CSV carries strings.
pub type RawProvinceRecord = serde_json::Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no upstream data at {url}")]
    NotFound { url: String },
    #[error(transparent)]
    Transport(HttpError),
    #[error("undecodable response body from {url}: {message}")]
    Decode { url: String, message: String },
}

impl From<HttpError> for FetchError {
    fn from(err: HttpError) -> Self {
        if err.is_not_found() {
            let url = match &err {
                HttpError::Status { url, .. } => url.clone(),
                HttpError::Request(_) => String::new(),
            };
            Self::NotFound { url }
        } else {
            Self::Transport(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("empty required field `{0}`")]
    EmptyField(&'static str),
    #[error("invalid date value `{0}`")]
    InvalidDate(String),
    #[error("region code `{0}` exceeds 3 characters")]
    RegionCodeTooLong(String),
    #[error("invalid case count `{0}`: expected a non-negative integer or empty")]
    InvalidCaseCount(String),
}

/// A source of raw province records for one reporting date.
#[async_trait]
pub trait ProvinceSource: Send + Sync {
    /// Fetch the single "latest" resource (JSON).
    async fn fetch_latest(&self) -> Result<Vec<RawProvinceRecord>, FetchError>;

    /// Fetch the dated resource (CSV) named after `date` as `YYYYMMDD`.
    async fn fetch_for_date(&self, date: NaiveDate) -> Result<Vec<RawProvinceRecord>, FetchError>;
}

/// The real DPC repository source.
#[derive(Debug)]
pub struct DpcSource {
    http: HttpFetcher,
    json_base_url: String,
    csv_base_url: String,
}

impl DpcSource {
    pub fn new(http: HttpFetcher, json_base_url: String, csv_base_url: String) -> Self {
        Self {
            http,
            json_base_url,
            csv_base_url,
        }
    }

    /// Source with the default repository URLs and client identity.
    pub fn with_defaults() -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            ..Default::default()
        })?;
        Ok(Self::new(
            http,
            DEFAULT_JSON_BASE_URL.to_string(),
            DEFAULT_CSV_BASE_URL.to_string(),
        ))
    }

    pub fn dated_filename(date: NaiveDate) -> String {
        format!("dpc-covid19-ita-province-{}.csv", date.format("%Y%m%d"))
    }
}

#[async_trait]
impl ProvinceSource for DpcSource {
    async fn fetch_latest(&self) -> Result<Vec<RawProvinceRecord>, FetchError> {
        let url = format!("{}{}", self.json_base_url, LATEST_FILENAME_JSON);
        info!(%url, "fetching latest province data");
        let resp = self.http.fetch_bytes("latest-json", &url).await?;
        parse_latest_json(&resp.body, &resp.final_url)
    }

    async fn fetch_for_date(&self, date: NaiveDate) -> Result<Vec<RawProvinceRecord>, FetchError> {
        let url = format!("{}{}", self.csv_base_url, Self::dated_filename(date));
        info!(%url, %date, "fetching dated province data");
        let resp = self.http.fetch_bytes("dated-csv", &url).await?;
        parse_dated_csv(&resp.body, &resp.final_url)
    }
}

/// Decode the "latest" resource: a JSON array of province objects.
pub fn parse_latest_json(body: &[u8], url: &str) -> Result<Vec<RawProvinceRecord>, FetchError> {
    serde_json::from_slice(body).map_err(|err| FetchError::Decode {
        url: url.to_string(),
        message: err.to_string(),
    })
}

/// Decode a dated resource: comma-separated rows under a header row.
///
/// Cells land in the field bag as JSON strings; short rows simply omit the
/// trailing fields and are left for normalization to reject.
pub fn parse_dated_csv(body: &[u8], url: &str) -> Result<Vec<RawProvinceRecord>, FetchError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body);

    let headers = reader
        .headers()
        .map_err(|err| FetchError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })?
        .clone();

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result.map_err(|err| FetchError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        let mut record = RawProvinceRecord::new();
        for (name, cell) in headers.iter().zip(row.iter()) {
            record.insert(name.to_string(), JsonValue::String(cell.to_string()));
        }
        records.push(record);
    }
    Ok(records)
}

/// Normalize one raw province record into the canonical shape.
///
/// Case-count asymmetry is deliberate: an absent or blank `totale_casi` is a
/// true zero upstream, while a non-integer value is corruption and fails the
/// record.
pub fn normalize(raw: &RawProvinceRecord) -> Result<CanonicalProvinceRecord, NormalizeError> {
    let submission_date = parse_submission_date(raw)?;
    let region_code = required_string(raw, "codice_regione")?;
    if region_code.len() > 3 {
        return Err(NormalizeError::RegionCodeTooLong(region_code));
    }
    let region_name = required_string(raw, "denominazione_regione")?;
    let case_count = parse_case_count(raw.get("totale_casi"))?;

    Ok(CanonicalProvinceRecord {
        submission_date,
        region_code,
        region_name,
        case_count,
    })
}

fn parse_submission_date(raw: &RawProvinceRecord) -> Result<NaiveDate, NormalizeError> {
    let value = raw
        .get("data")
        .and_then(JsonValue::as_str)
        .ok_or(NormalizeError::MissingField("data"))?;
    if value.trim().is_empty() {
        return Err(NormalizeError::MissingField("data"));
    }
    // ISO-8601 date-time; only the date portion matters.
    let date_part = value.split('T').next().unwrap_or(value);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|_| NormalizeError::InvalidDate(value.to_string()))
}

fn required_string(raw: &RawProvinceRecord, name: &'static str) -> Result<String, NormalizeError> {
    let value = raw.get(name).ok_or(NormalizeError::MissingField(name))?;
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        // JSON carries numeric region codes; treat them as opaque strings.
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Null => return Err(NormalizeError::MissingField(name)),
        other => other.to_string(),
    };
    if text.is_empty() {
        return Err(NormalizeError::EmptyField(name));
    }
    Ok(text)
}

fn parse_case_count(value: Option<&JsonValue>) -> Result<i64, NormalizeError> {
    let count = match value {
        None | Some(JsonValue::Null) => 0,
        Some(JsonValue::String(s)) if s.trim().is_empty() => 0,
        Some(JsonValue::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| NormalizeError::InvalidCaseCount(s.clone()))?,
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .ok_or_else(|| NormalizeError::InvalidCaseCount(n.to_string()))?,
        Some(other) => return Err(NormalizeError::InvalidCaseCount(other.to_string())),
    };
    if count < 0 {
        warn!(count, "negative case count in upstream record");
        return Err(NormalizeError::InvalidCaseCount(count.to_string()));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(entries: &[(&str, JsonValue)]) -> RawProvinceRecord {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn base_record() -> RawProvinceRecord {
        raw(&[
            ("data", json!("2020-03-15T17:00:00")),
            ("codice_regione", json!(12)),
            ("denominazione_regione", json!("Lazio")),
            ("codice_provincia", json!(58)),
            ("denominazione_provincia", json!("Roma")),
            ("totale_casi", json!(300)),
        ])
    }

    #[test]
    fn normalizes_json_shaped_record() {
        let record = normalize(&base_record()).unwrap();
        assert_eq!(
            record.submission_date,
            NaiveDate::from_ymd_opt(2020, 3, 15).unwrap()
        );
        assert_eq!(record.region_code, "12");
        assert_eq!(record.region_name, "Lazio");
        assert_eq!(record.case_count, 300);
    }

    #[test]
    fn date_time_portion_is_discarded() {
        let mut r = base_record();
        r.insert("data".into(), json!("2020-03-15T00:00:00"));
        assert_eq!(
            normalize(&r).unwrap().submission_date,
            NaiveDate::from_ymd_opt(2020, 3, 15).unwrap()
        );

        r.insert("data".into(), json!("not-a-date"));
        assert!(matches!(normalize(&r), Err(NormalizeError::InvalidDate(_))));

        r.remove("data");
        assert!(matches!(normalize(&r), Err(NormalizeError::MissingField("data"))));
    }

    #[test]
    fn csv_zero_padded_codes_stay_opaque() {
        let mut r = base_record();
        r.insert("codice_regione".into(), json!("09"));
        assert_eq!(normalize(&r).unwrap().region_code, "09");
    }

    #[test]
    fn region_fields_are_required_and_bounded() {
        let mut r = base_record();
        r.insert("denominazione_regione".into(), json!("   "));
        assert!(matches!(
            normalize(&r),
            Err(NormalizeError::EmptyField("denominazione_regione"))
        ));

        let mut r = base_record();
        r.remove("codice_regione");
        assert!(matches!(
            normalize(&r),
            Err(NormalizeError::MissingField("codice_regione"))
        ));

        let mut r = base_record();
        r.insert("codice_regione".into(), json!("1234"));
        assert!(matches!(normalize(&r), Err(NormalizeError::RegionCodeTooLong(_))));
    }

    #[test]
    fn absent_case_count_is_zero_but_garbage_is_an_error() {
        let mut r = base_record();
        r.remove("totale_casi");
        assert_eq!(normalize(&r).unwrap().case_count, 0);

        r.insert("totale_casi".into(), json!(null));
        assert_eq!(normalize(&r).unwrap().case_count, 0);

        r.insert("totale_casi".into(), json!("  "));
        assert_eq!(normalize(&r).unwrap().case_count, 0);

        r.insert("totale_casi".into(), json!("150"));
        assert_eq!(normalize(&r).unwrap().case_count, 150);

        r.insert("totale_casi".into(), json!("XYZ"));
        assert!(matches!(normalize(&r), Err(NormalizeError::InvalidCaseCount(_))));

        r.insert("totale_casi".into(), json!(-5));
        assert!(matches!(normalize(&r), Err(NormalizeError::InvalidCaseCount(_))));
    }

    #[test]
    fn latest_json_decodes_to_field_bags() {
        let body = br#"[
            {"data": "2020-03-15T17:00:00", "codice_regione": 12,
             "denominazione_regione": "Lazio", "totale_casi": 300},
            {"data": "2020-03-15T17:00:00", "codice_regione": 13,
             "denominazione_regione": "Abruzzo"}
        ]"#;
        let records = parse_latest_json(body, "test://latest").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["codice_regione"], json!(12));
        assert!(!records[1].contains_key("totale_casi"));

        let err = parse_latest_json(b"<html>rate limited</html>", "test://latest").unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[test]
    fn dated_csv_decodes_cells_as_strings() {
        let body = b"data,codice_regione,denominazione_regione,codice_provincia,totale_casi\n\
            2020-03-15T17:00:00,12,Lazio,058,300\n\
            2020-03-15T17:00:00,09,Toscana,048,\n";
        let records = parse_dated_csv(body, "test://dated").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["codice_regione"], json!("12"));
        assert_eq!(records[0]["totale_casi"], json!("300"));
        // Empty trailing cell still normalizes to a zero count.
        assert_eq!(normalize(&records[1]).unwrap().case_count, 0);
    }

    #[test]
    fn dated_filename_is_zero_padded() {
        let date = NaiveDate::from_ymd_opt(2020, 3, 5).unwrap();
        assert_eq!(
            DpcSource::dated_filename(date),
            "dpc-covid19-ita-province-20200305.csv"
        );
    }
}
