use bytes::{Buf, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{md5_hash, sasl};
use postgres_protocol::message::backend::{self, ErrorResponseBody, Message};
use postgres_protocol::message::frontend;
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_postgres::types::PgLsn;
use tracing::{debug, info, warn};

use super::protocol::standby_status_update;
use crate::config::PostgresConfig;
use crate::{Error, Result};

/// A PostgreSQL connection in logical replication mode
/// (`replication=database`), speaking the frontend/backend protocol
/// directly so it can enter CopyBoth mode.
pub struct ReplicationConnection {
    stream: TcpStream,
    buffer: BytesMut,
    replication_started: bool,
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: PgLsn,
    pub dbname: Option<String>,
}

/// One row of a simple-query result, with column names attached.
#[derive(Debug, Clone)]
struct SimpleRow {
    columns: Vec<String>,
    values: Vec<Option<String>>,
}

impl SimpleRow {
    fn get(&self, name: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx)?.as_deref()
    }

    fn require(&self, name: &str) -> Result<&str> {
        self.get(name).ok_or_else(|| {
            Error::Protocol(format!("IDENTIFY_SYSTEM returned no {}", name))
        })
    }
}

/// A backend frame. `postgres_protocol` has no CopyBothResponse, so that
/// one is recognized here.
enum Frame {
    CopyBothResponse,
    Message(Message),
}

/// Take one complete frame off the front of `buf`, or `None` if it holds
/// only part of one.
fn parse_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    if buf[0] == b'W' {
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 {
            return Err(Error::Protocol(format!(
                "Invalid CopyBothResponse length {}",
                len
            )));
        }
        let total = len as usize + 1;
        if buf.len() < total {
            return Ok(None);
        }
        buf.advance(total);
        return Ok(Some(Frame::CopyBothResponse));
    }
    Ok(backend::Message::parse(buf)?.map(Frame::Message))
}

impl SystemInfo {
    fn from_row(row: &SimpleRow) -> Result<Self> {
        let xlogpos = row.require("xlogpos")?;
        let xlogpos = xlogpos
            .parse::<PgLsn>()
            .map_err(|_| Error::Protocol(format!("Invalid xlogpos {:?}", xlogpos)))?;
        let timeline = row.require("timeline")?;
        let timeline = timeline
            .parse()
            .map_err(|_| Error::Protocol(format!("Invalid timeline {:?}", timeline)))?;

        Ok(Self {
            system_id: row.require("systemid")?.to_string(),
            timeline,
            xlogpos,
            dbname: row.get("dbname").map(|s| s.to_string()),
        })
    }
}

impl ReplicationConnection {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        info!(
            host = %config.host,
            port = config.port,
            user = %config.username,
            "Creating replication connection to PostgreSQL"
        );

        let stream = tokio::time::timeout(
            config.connect_timeout(),
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "Connection to {}:{} timed out after {}s",
                config.host, config.port, config.connect_timeout_secs
            ))
        })??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            buffer: BytesMut::with_capacity(8192),
            replication_started: false,
        };

        let mut buf = BytesMut::new();
        frontend::startup_message(
            [
                ("user", config.username.as_str()),
                ("database", config.database.as_str()),
                ("replication", "database"),
                ("application_name", "pg-pb3-fuzzer"),
            ],
            &mut buf,
        )?;
        conn.write_all(&buf).await?;

        conn.authenticate(&config.username, config.password()).await?;
        conn.wait_for_ready().await?;

        info!("Successfully connected to PostgreSQL in replication mode");
        Ok(conn)
    }

    async fn authenticate(&mut self, user: &str, password: Option<&str>) -> Result<()> {
        loop {
            match self.read_message().await? {
                Message::AuthenticationOk => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                Message::AuthenticationCleartextPassword => {
                    let pass = require_password(password)?;
                    let mut buf = BytesMut::new();
                    frontend::password_message(pass.as_bytes(), &mut buf)?;
                    self.write_all(&buf).await?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let pass = require_password(password)?;
                    let hash = md5_hash(user.as_bytes(), pass.as_bytes(), body.salt());
                    let mut buf = BytesMut::new();
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                    self.write_all(&buf).await?;
                }
                Message::AuthenticationSasl(body) => {
                    let pass = require_password(password)?;
                    let mechanisms: Vec<String> = body
                        .mechanisms()
                        .map(|m| Ok(m.to_string()))
                        .collect()?;
                    if !mechanisms.iter().any(|m| m == sasl::SCRAM_SHA_256) {
                        return Err(Error::Authentication(format!(
                            "No supported SASL mechanism in {:?}",
                            mechanisms
                        )));
                    }
                    self.scram_sha_256(pass).await?;
                }
                Message::ErrorResponse(body) => return Err(server_error(&body)),
                _ => {
                    return Err(Error::Authentication(
                        "Unexpected message during authentication".to_string(),
                    ))
                }
            }
        }
    }

    async fn scram_sha_256(&mut self, password: &str) -> Result<()> {
        let mut scram =
            sasl::ScramSha256::new(password.as_bytes(), sasl::ChannelBinding::unsupported());

        let mut buf = BytesMut::new();
        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut buf)?;
        self.write_all(&buf).await?;

        match self.read_message().await? {
            Message::AuthenticationSaslContinue(body) => scram.update(body.data())?,
            Message::ErrorResponse(body) => return Err(server_error(&body)),
            _ => {
                return Err(Error::Authentication(
                    "Expected AuthenticationSASLContinue".to_string(),
                ))
            }
        }

        let mut buf = BytesMut::new();
        frontend::sasl_response(scram.message(), &mut buf)?;
        self.write_all(&buf).await?;

        match self.read_message().await? {
            Message::AuthenticationSaslFinal(body) => scram.finish(body.data())?,
            Message::ErrorResponse(body) => return Err(server_error(&body)),
            _ => {
                return Err(Error::Authentication(
                    "Expected AuthenticationSASLFinal".to_string(),
                ))
            }
        }

        Ok(())
    }

    async fn wait_for_ready(&mut self) -> Result<()> {
        loop {
            match self.read_message().await? {
                Message::ReadyForQuery(_) => {
                    debug!("Ready for query");
                    return Ok(());
                }
                Message::ErrorResponse(body) => return Err(server_error(&body)),
                // ParameterStatus, BackendKeyData, NoticeResponse
                _ => {}
            }
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemInfo> {
        debug!("Sending IDENTIFY_SYSTEM command");

        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Protocol("IDENTIFY_SYSTEM returned no rows".to_string()))?;
        let info = SystemInfo::from_row(row)?;

        debug!("System info: {:?}", info);
        Ok(info)
    }

    /// Issue `START_REPLICATION` and enter CopyBoth mode.
    pub async fn start_replication(
        &mut self,
        slot_name: &str,
        start_lsn: PgLsn,
        options: &[String],
    ) -> Result<()> {
        let mut query = format!("START_REPLICATION SLOT {} LOGICAL {}", slot_name, start_lsn);
        if !options.is_empty() {
            query.push_str(&format!(" ({})", options.join(", ")));
        }

        info!(slot = slot_name, lsn = %start_lsn, "Starting replication");
        debug!(query = %query, "START_REPLICATION");

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.write_all(&buf).await?;

        loop {
            let message = match self.read_frame().await? {
                Frame::CopyBothResponse => {
                    info!("Entered CopyBoth mode");
                    self.replication_started = true;
                    return Ok(());
                }
                Frame::Message(message) => message,
            };
            match message {
                Message::ErrorResponse(body) => return Err(server_error(&body)),
                Message::NoticeResponse(_) | Message::ParameterStatus(_) => {}
                _ => {
                    return Err(Error::Protocol(
                        "Unexpected response to START_REPLICATION".to_string(),
                    ))
                }
            }
        }
    }

    /// Next CopyData payload, or `None` once the server ends the copy.
    ///
    /// Cancel-safe: partially received frames stay buffered.
    pub async fn next_copy_data(&mut self) -> Result<Option<Bytes>> {
        if !self.replication_started {
            return Err(Error::Replication {
                message: "Replication not started".to_string(),
            });
        }

        loop {
            match self.read_message().await? {
                Message::CopyData(body) => return Ok(Some(body.into_bytes())),
                Message::CopyDone => return Ok(None),
                Message::ErrorResponse(body) => return Err(server_error(&body)),
                Message::NoticeResponse(_) | Message::ParameterStatus(_) => {}
                _ => {
                    return Err(Error::Protocol(
                        "Unexpected message in CopyBoth mode".to_string(),
                    ))
                }
            }
        }
    }

    pub async fn send_status_update(&mut self, lsn: u64) -> Result<()> {
        if !self.replication_started {
            return Err(Error::Replication {
                message: "No active replication stream".to_string(),
            });
        }

        let payload = standby_status_update(lsn, SystemTime::now(), false);
        let mut buf = BytesMut::new();
        frontend::CopyData::new(payload)?.write(&mut buf);
        self.write_all(&buf).await?;

        debug!(lsn = %PgLsn::from(lsn), "Sent standby status update");
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        info!("Closing replication connection");

        let mut buf = BytesMut::new();
        if self.replication_started {
            frontend::copy_done(&mut buf);
        }
        frontend::terminate(&mut buf);
        if let Err(e) = self.write_all(&buf).await {
            warn!("Failed to send Terminate: {}", e);
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!("Socket shutdown failed: {}", e);
        }
        Ok(())
    }

    async fn simple_query(&mut self, query: &str) -> Result<Vec<SimpleRow>> {
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        self.write_all(&buf).await?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows = Vec::new();
        let mut error = None;

        loop {
            match self.read_message().await? {
                Message::RowDescription(body) => {
                    columns = body.fields().map(|f| Ok(f.name().to_string())).collect()?;
                }
                Message::DataRow(body) => {
                    let data = body.buffer();
                    let values: Vec<Option<String>> = body
                        .ranges()
                        .map(|range| {
                            Ok(range.map(|r| String::from_utf8_lossy(&data[r]).into_owned()))
                        })
                        .collect()?;
                    rows.push(SimpleRow {
                        columns: columns.clone(),
                        values,
                    });
                }
                Message::ErrorResponse(body) => error = Some(server_error(&body)),
                Message::ReadyForQuery(_) => break,
                _ => {}
            }
        }

        match error {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    /// Read one backend message outside of the START_REPLICATION
    /// handshake. Cancel-safe.
    async fn read_message(&mut self) -> Result<Message> {
        match self.read_frame().await? {
            Frame::Message(message) => Ok(message),
            Frame::CopyBothResponse => Err(Error::Protocol(
                "Unexpected CopyBothResponse".to_string(),
            )),
        }
    }

    /// Read one backend frame. Cancel-safe.
    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = parse_frame(&mut self.buffer)? {
                return Ok(frame);
            }
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(Error::Connection(
                    "Server closed the replication connection".to_string(),
                ));
            }
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

fn require_password(password: Option<&str>) -> Result<&str> {
    password.ok_or_else(|| {
        Error::Authentication("Password required but not provided".to_string())
    })
}

fn server_error(body: &ErrorResponseBody) -> Error {
    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();

    let mut fields = body.fields();
    while let Ok(Some(field)) = fields.next() {
        let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
        match field.type_() {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }

    Error::Server {
        severity,
        code,
        message,
    }
}
