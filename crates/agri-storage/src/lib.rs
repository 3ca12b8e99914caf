//! Archive download + delimited-table extraction, and record stores.

use std::io::{Read, Seek};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};
use zip::ZipArchive;

pub mod stores;

pub use stores::{
    connect_pool, MemoryStore, PgStore, PgSurveyStore, PgUnitStore, PgWeatherStore, RecordStore,
    StoreError, SurveyRow, UnitRow, WeatherRow,
};

pub const CRATE_NAME: &str = "agri-storage";

/// Survey extracts are semicolon separated.
pub const FIELD_DELIMITER: u8 = b';';

/// Where a table came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveProvenance {
    pub url: String,
    /// Entry name as stored in the archive (may include a directory prefix).
    pub member_name: String,
    pub sha256: String,
    pub byte_size: u64,
}

/// Every row of the extracted member, header included as row 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimitedTable {
    pub rows: Vec<Vec<String>>,
    pub provenance: ArchiveProvenance,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to download {url}: http status {status}")]
    HttpStatus { status: u16, url: String },
    #[error("failed to open downloaded zip archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("file '{0}' not found in the zip archive")]
    NotFound(String),
    #[error("failed to read delimited records from '{member}': {source}")]
    Parse {
        member: String,
        #[source]
        source: DelimitedError,
    },
    #[error("temporary archive file: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive decoding task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A `;` table that cannot be read as well-formed quoted CSV.
#[derive(Debug, Error)]
pub enum DelimitedError {
    #[error("line {line}: bare \" in non-quoted field")]
    BareQuote { line: u64 },
    #[error("line {line}: extraneous or missing \" in quoted field")]
    ExtraneousQuote { line: u64 },
    #[error("line {line}: quoted field is never closed")]
    UnterminatedQuote { line: u64 },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("reading table: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Transport failure or a non-200 answer.
    pub fn is_download(&self) -> bool {
        matches!(self, Self::Download { .. } | Self::HttpStatus { .. })
    }
}

/// Capability: "download archive, extract member, parse as delimited rows".
#[async_trait]
pub trait TableSource: Send + Sync {
    async fn fetch_delimited_table(
        &self,
        archive_url: &str,
        member_name: &str,
    ) -> Result<DelimitedTable, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ArchiveFetcherConfig {
    /// Whole-request deadline, body streaming included.
    pub timeout: Duration,
    /// Upstream open-data hosts have served broken certificate chains, so
    /// verification is off unless explicitly enabled.
    pub verify_tls: bool,
    pub user_agent: Option<String>,
}

impl Default for ArchiveFetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            verify_tls: false,
            user_agent: Some(concat!("agri-ingestor/", env!("CARGO_PKG_VERSION")).to_string()),
        }
    }
}

/// Single-attempt HTTP archive fetcher. Failures surface to the caller unretried.
#[derive(Debug, Clone)]
pub struct ArchiveFetcher {
    client: reqwest::Client,
    verify_tls: bool,
}

impl ArchiveFetcher {
    pub fn new(config: ArchiveFetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building archive http client")?;
        Ok(Self {
            client,
            verify_tls: config.verify_tls,
        })
    }

    pub fn verifies_tls(&self) -> bool {
        self.verify_tls
    }

    /// Streams the body into a temp file, hashing as it goes. The file is
    /// deleted when the returned handle drops.
    async fn download_to_temp(
        &self,
        archive_url: &str,
    ) -> Result<(tempfile::NamedTempFile, String, u64), FetchError> {
        let download_error = |source| FetchError::Download {
            url: archive_url.to_string(),
            source,
        };

        let mut response = self
            .client
            .get(archive_url)
            .send()
            .await
            .map_err(download_error)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        let temp = tempfile::Builder::new()
            .prefix("downloaded-")
            .suffix(".zip")
            .tempfile()?;
        let mut file = tokio::fs::File::from_std(temp.reopen()?);
        let mut hasher = Sha256::new();
        let mut byte_size = 0u64;

        while let Some(chunk) = response.chunk().await.map_err(download_error)? {
            hasher.update(&chunk);
            byte_size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok((temp, hex::encode(hasher.finalize()), byte_size))
    }
}

#[async_trait]
impl TableSource for ArchiveFetcher {
    async fn fetch_delimited_table(
        &self,
        archive_url: &str,
        member_name: &str,
    ) -> Result<DelimitedTable, FetchError> {
        let span = info_span!("archive_fetch", url = archive_url, member = member_name);
        async move {
            let (temp, sha256, byte_size) = self.download_to_temp(archive_url).await?;
            info!(byte_size, %sha256, "archive downloaded");

            let wanted = member_name.to_string();
            let (entry_name, rows) = tokio::task::spawn_blocking(
                move || -> Result<(String, Vec<Vec<String>>), FetchError> {
                    let file = temp.reopen()?;
                    read_member_rows(file, &wanted)
                },
            )
            .await??;
            info!(entry = %entry_name, rows = rows.len(), "delimited member parsed");

            Ok(DelimitedTable {
                rows,
                provenance: ArchiveProvenance {
                    url: archive_url.to_string(),
                    member_name: entry_name,
                    sha256,
                    byte_size,
                },
            })
        }
        .instrument(span)
        .await
    }
}

/// Finds `member_name` by case-insensitive base name and parses it.
/// Returns the matched entry's full name alongside its rows.
pub fn read_member_rows<R: Read + Seek>(
    reader: R,
    member_name: &str,
) -> Result<(String, Vec<Vec<String>>), FetchError> {
    let mut archive = ZipArchive::new(reader)?;

    let mut found = None;
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        if !entry.is_dir() && base_name_matches(entry.name(), member_name) {
            found = Some(index);
            break;
        }
    }
    let Some(index) = found else {
        return Err(FetchError::NotFound(member_name.to_string()));
    };

    let entry = archive.by_index(index)?;
    let entry_name = entry.name().to_string();
    let rows = parse_delimited(entry).map_err(|source| FetchError::Parse {
        member: entry_name.clone(),
        source,
    })?;
    Ok((entry_name, rows))
}

fn base_name_matches(entry_name: &str, member_name: &str) -> bool {
    let base = entry_name.rsplit('/').next().unwrap_or(entry_name);
    base.chars()
        .flat_map(char::to_lowercase)
        .eq(member_name.chars().flat_map(char::to_lowercase))
}

/// Strict `;` CSV: every record must have the header's field count and
/// quoting must be well formed. Cells are decoded lossily so legacy-encoded
/// exports still load.
pub fn parse_delimited<R: Read>(mut reader: R) -> Result<Vec<Vec<String>>, DelimitedError> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw)?;
    check_quoting(&raw)?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(FIELD_DELIMITER)
        .has_headers(false)
        .from_reader(raw.as_slice());

    let rows: Vec<Vec<String>> = reader
        .byte_records()
        .map(|record| {
            record.map(|record| {
                record
                    .iter()
                    .map(|field| String::from_utf8_lossy(field).into_owned())
                    .collect()
            })
        })
        .collect::<Result<_, csv::Error>>()?;
    Ok(rows)
}

#[derive(Clone, Copy)]
enum QuoteState {
    FieldStart,
    Unquoted,
    Quoted { opened_on: u64 },
    /// A `"` inside a quoted field: either an escaped quote or the closing one.
    QuoteInQuoted { opened_on: u64 },
    /// `\r` right after a closing quote; only `\n` may follow.
    ClosingCr,
}

/// Quotes may only open a field, and a closing quote must be followed by a
/// delimiter or a line end. The `csv` reader itself tolerates stray quotes.
fn check_quoting(raw: &[u8]) -> Result<(), DelimitedError> {
    use QuoteState::*;

    let mut line = 1u64;
    let mut state = FieldStart;

    for &byte in raw {
        state = match (state, byte) {
            (FieldStart, b'"') => Quoted { opened_on: line },
            (Unquoted, b'"') => return Err(DelimitedError::BareQuote { line }),
            (FieldStart | Unquoted, FIELD_DELIMITER) => FieldStart,
            (FieldStart | Unquoted, b'\n') => {
                line += 1;
                FieldStart
            }
            (FieldStart | Unquoted, _) => Unquoted,
            (Quoted { opened_on }, b'"') => QuoteInQuoted { opened_on },
            (Quoted { opened_on }, b'\n') => {
                line += 1;
                Quoted { opened_on }
            }
            (Quoted { opened_on }, _) => Quoted { opened_on },
            (QuoteInQuoted { opened_on }, b'"') => Quoted { opened_on },
            (QuoteInQuoted { .. }, FIELD_DELIMITER) => FieldStart,
            (QuoteInQuoted { .. }, b'\r') => ClosingCr,
            (QuoteInQuoted { .. } | ClosingCr, b'\n') => {
                line += 1;
                FieldStart
            }
            (QuoteInQuoted { .. } | ClosingCr, _) => {
                return Err(DelimitedError::ExtraneousQuote { line })
            }
        };
    }

    match state {
        Quoted { opened_on } => Err(DelimitedError::UnterminatedQuote { line: opened_on }),
        _ => Ok(()),
    }
}

/// Serves one fixed table for any request; records what was asked for.
#[derive(Debug, Default)]
pub struct StaticTableSource {
    rows: Option<Vec<Vec<String>>>,
    requests: Mutex<Vec<(String, String)>>,
}

impl StaticTableSource {
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        Self {
            rows: Some(rows),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every fetch fails as if the member were absent from the archive.
    pub fn missing_member() -> Self {
        Self::default()
    }

    pub fn from_text(text: &str) -> Result<Self, DelimitedError> {
        Ok(Self::new(parse_delimited(text.as_bytes())?))
    }

    pub async fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl TableSource for StaticTableSource {
    async fn fetch_delimited_table(
        &self,
        archive_url: &str,
        member_name: &str,
    ) -> Result<DelimitedTable, FetchError> {
        self.requests
            .lock()
            .await
            .push((archive_url.to_string(), member_name.to_string()));

        let rows = self
            .rows
            .clone()
            .ok_or_else(|| FetchError::NotFound(member_name.to_string()))?;
        Ok(DelimitedTable {
            rows,
            provenance: ArchiveProvenance {
                url: archive_url.to_string(),
                member_name: member_name.to_string(),
                sha256: String::new(),
                byte_size: 0,
            },
        })
    }
}
