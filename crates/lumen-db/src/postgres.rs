//! Postgres connector built on tokio-postgres, with rustls for TLS targets.

use std::error::Error as StdError;
use std::fmt::Write as _;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::PemObject;
use serde_json::Value;
use tokio_postgres::config::SslMode;
use tokio_postgres::error::ErrorPosition;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use crate::error::{ConnectError, DriverError, DriverErrorClass};
use crate::param::TextParam;
use crate::rowset::{Cell, RawColumn, RowSet};
use crate::session::{Connector, Session};
use crate::target::TargetDescriptor;

type BoxError = Box<dyn StdError + Sync + Send>;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Opens tokio-postgres sessions. The rustls connector is built on first use
/// so plaintext-only deployments never touch the certificate store.
pub struct PgConnector {
    application_name: String,
    ssl_root_cert: Option<PathBuf>,
    tls: OnceCell<MakeRustlsConnect>,
}

impl PgConnector {
    pub fn new(application_name: impl Into<String>, ssl_root_cert: Option<PathBuf>) -> Self {
        Self {
            application_name: application_name.into(),
            ssl_root_cert,
            tls: OnceCell::new(),
        }
    }

    fn tls(&self) -> Result<MakeRustlsConnect, ConnectError> {
        self.tls
            .get_or_try_init(|| build_tls_connector(self.ssl_root_cert.as_deref()))
            .cloned()
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Session = PgSession;

    async fn connect(
        &self,
        target: &TargetDescriptor,
        connect_timeout: Duration,
    ) -> Result<PgSession, ConnectError> {
        let mut config = Config::new();
        config
            .host(&target.hostname)
            .port(target.port)
            .user(&target.user)
            .password(&target.password)
            .dbname(&target.database)
            .application_name(&self.application_name)
            .connect_timeout(connect_timeout);
        let key = target.pool_key().to_string();

        let attempt = async {
            if target.use_tls {
                config.ssl_mode(SslMode::Require);
                let tls = self.tls()?;
                let (client, connection) = config
                    .connect(tls)
                    .await
                    .map_err(|err| classify_connect_error(&err, target))?;
                spawn_connection(connection, key);
                Ok::<_, ConnectError>(client)
            } else {
                config.ssl_mode(SslMode::Disable);
                let (client, connection) = config
                    .connect(NoTls)
                    .await
                    .map_err(|err| classify_connect_error(&err, target))?;
                spawn_connection(connection, key);
                Ok(client)
            }
        };
        let client = tokio::time::timeout(connect_timeout, attempt)
            .await
            .map_err(|_| ConnectError::Timeout {
                host: target.hostname.clone(),
                port: target.port,
            })??;
        Ok(PgSession { client })
    }
}

fn spawn_connection<F>(connection: F, key: String)
where
    F: Future<Output = Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(pool = %key, error = %err, "postgres connection closed with error");
        }
    });
}

fn classify_connect_error(err: &tokio_postgres::Error, target: &TargetDescriptor) -> ConnectError {
    if let Some(db) = err.as_db_error() {
        return ConnectError::from_sqlstate(db.code().code(), db.message(), target);
    }
    if let Some(io_err) = io_source(err) {
        return ConnectError::from_io(io_err.kind(), io_err.to_string(), target);
    }
    ConnectError::Other {
        code: None,
        message: err.to_string(),
    }
}

fn io_source(err: &tokio_postgres::Error) -> Option<&io::Error> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        source = cause.source();
    }
    None
}

fn build_tls_connector(root_cert: Option<&Path>) -> Result<MakeRustlsConnect, ConnectError> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!(error = %err, "skipping unreadable native root certificate");
    }
    roots.add_parsable_certificates(native.certs);
    if let Some(path) = root_cert {
        let certs = CertificateDer::pem_file_iter(path).map_err(|err| {
            ConnectError::Tls(format!("cannot read {}: {err}", path.display()))
        })?;
        for cert in certs {
            let cert = cert.map_err(|err| ConnectError::Tls(err.to_string()))?;
            roots
                .add(cert)
                .map_err(|err| ConnectError::Tls(err.to_string()))?;
        }
    }
    if roots.is_empty() {
        return Err(ConnectError::Tls(
            "no root certificates available for TLS".to_string(),
        ));
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| ConnectError::Tls(err.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls_config))
}

pub struct PgSession {
    client: Client,
}

#[async_trait]
impl Session for PgSession {
    async fn set_statement_timeout(&self, timeout: Duration) -> Result<(), DriverError> {
        // 0 would disable the timeout entirely.
        let millis = timeout.as_millis().max(1);
        self.client
            .batch_execute(&format!("SET statement_timeout = {millis}"))
            .await
            .map_err(|err| driver_error(&err))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<RowSet, DriverError> {
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|err| driver_error(&err))?;
        let bound: Vec<TextParam<'_>> = params.iter().map(TextParam).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|param| param as &(dyn ToSql + Sync))
            .collect();
        let rows = self
            .client
            .query(&statement, &refs)
            .await
            .map_err(|err| driver_error(&err))?;

        let columns = statement
            .columns()
            .iter()
            .map(|column| RawColumn {
                name: column.name().to_string(),
                type_oid: column.type_().oid(),
            })
            .collect();
        let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        Ok(RowSet { columns, rows })
    }

    fn is_broken(&self) -> bool {
        self.client.is_closed()
    }
}

fn driver_error(err: &tokio_postgres::Error) -> DriverError {
    if let Some(db) = err.as_db_error() {
        let code = db.code().code();
        let mut error =
            DriverError::new(DriverErrorClass::from_sqlstate(code), db.message()).with_code(code);
        if let Some(ErrorPosition::Original(position)) = db.position() {
            error = error.with_position(*position);
        }
        if let Some(detail) = db.detail() {
            error = error.with_detail(detail);
        }
        return error;
    }
    let class = if err.is_closed() || io_source(err).is_some() {
        DriverErrorClass::Connection
    } else {
        DriverErrorClass::Statement
    };
    DriverError::new(class, err.to_string())
}

/// Borrowed wire bytes of any column type.
struct RawValue<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawValue<'a> {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Self(raw))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn decode_row(row: &Row) -> Result<Vec<Cell>, DriverError> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            decode_cell(row, idx, column.type_()).map_err(|err| {
                DriverError::new(
                    DriverErrorClass::Statement,
                    format!("cannot decode column `{}`: {err}", column.name()),
                )
            })
        })
        .collect()
}

fn decode_cell(row: &Row, idx: usize, ty: &Type) -> Result<Cell, BoxError> {
    let cell = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Cell::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|value| Cell::Int(value.into())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|value| Cell::Int(value.into())),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|value| Cell::Int(value.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Cell::BigInt),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|value| Cell::Float(value.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Cell::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<RawValue<'_>>>(idx)?
            .map(|raw| decode_numeric(raw.0))
            .transpose()?
            .map(Cell::Numeric),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(idx)?.map(Cell::Text)
        }
        Type::DATE => row.try_get::<_, Option<chrono::NaiveDate>>(idx)?.map(Cell::Date),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(Cell::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map(Cell::TimestampTz),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|value| Cell::Text(value.to_string())),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx)?.map(Cell::Json),
        _ => row
            .try_get::<_, Option<RawValue<'_>>>(idx)?
            .map(|raw| Cell::Text(render_raw(raw.0))),
    };
    Ok(cell.unwrap_or(Cell::Null))
}

// Enum and domain-over-text columns arrive as UTF-8; anything else as hex.
fn render_raw(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let mut out = String::with_capacity(2 + raw.len() * 2);
            out.push_str("\\x");
            for byte in raw {
                let _ = write!(out, "{byte:02x}");
            }
            out
        }
    }
}

/// Renders the binary `numeric` wire format as exact decimal text.
fn decode_numeric(raw: &[u8]) -> Result<String, String> {
    let word = |at: usize| -> Option<u16> {
        Some(u16::from_be_bytes([*raw.get(at)?, *raw.get(at + 1)?]))
    };
    let malformed = || "malformed numeric value".to_string();
    let ndigits = usize::from(word(0).ok_or_else(malformed)?);
    let weight = i32::from(word(2).ok_or_else(malformed)? as i16);
    let sign = word(4).ok_or_else(malformed)?;
    let dscale = usize::from(word(6).ok_or_else(malformed)?);
    let digits = (0..ndigits)
        .map(|i| word(8 + i * 2))
        .collect::<Option<Vec<u16>>>()
        .ok_or_else(malformed)?;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        _ => return Err(malformed()),
    }

    let digit_at = |idx: i32| -> u16 {
        usize::try_from(idx)
            .ok()
            .and_then(|idx| digits.get(idx).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for idx in 0..=weight {
            if idx == 0 {
                let _ = write!(out, "{}", digit_at(idx));
            } else {
                let _ = write!(out, "{:04}", digit_at(idx));
            }
        }
    }
    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while fraction.len() < dscale {
            let _ = write!(fraction, "{:04}", digit_at(idx));
            idx += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}
