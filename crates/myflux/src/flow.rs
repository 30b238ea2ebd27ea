//! Query flows: the user-facing `Client` and the decode-context
//! transitions that drive the engine.
//!
//! Flows translate one user request into a sequence of client messages and
//! a context program; the engine only moves bytes and applies the
//! transition function defined here.

use std::sync::{Arc, Mutex};

use log::debug;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use myflux_core::{ConnectionErrorKind, Error, Result, Row, RowMetadata};

use crate::config::{Config, ZeroDate};
use crate::engine::{self, Channel, ConnectionInfo, Exchange, Transport};
use crate::handshake;
use crate::message::client::param_type_signature;
use crate::message::{ClientMessage, ServerMessage};
use crate::protocol::DecodeContext;
use crate::result::ResultSet;
use crate::row::{decode_binary_row, decode_text_row};
use crate::session::Session;
use crate::statement::{Bindings, ParsedQuery};
use crate::types::{ColumnDefinition, FieldType};

/// One step of the context program.
pub(crate) struct Step {
    pub context: DecodeContext,
    /// The exchange terminates after this message
    pub done: bool,
}

fn next(context: DecodeContext) -> Step {
    Step {
        context,
        done: false,
    }
}

fn done(context: DecodeContext) -> Step {
    Step {
        context,
        done: true,
    }
}

/// Advance the decode context in response to one decoded message.
pub(crate) fn advance(
    context: &DecodeContext,
    message: &ServerMessage,
    deprecate_eof: bool,
    rows_binary: bool,
) -> Step {
    match (context, message) {
        (DecodeContext::Command, ServerMessage::Ok(ok)) => {
            if ok.has_more_results() {
                next(DecodeContext::Command)
            } else {
                done(DecodeContext::Command)
            }
        }
        (DecodeContext::Command, ServerMessage::Eof(eof)) => {
            if eof.has_more_results() {
                next(DecodeContext::Command)
            } else {
                done(DecodeContext::Command)
            }
        }
        (DecodeContext::Command, ServerMessage::ColumnCount(count)) => {
            next(DecodeContext::result_metadata(count.0))
        }

        (DecodeContext::WaitPrepare, ServerMessage::PreparedOk(ok)) => {
            if ok.parameters > 0 || ok.columns > 0 {
                next(DecodeContext::prep_metadata(ok.parameters, ok.columns))
            } else {
                done(DecodeContext::Command)
            }
        }
        (DecodeContext::WaitPrepare, ServerMessage::Ok(_) | ServerMessage::Eof(_)) => {
            done(DecodeContext::Command)
        }

        (
            DecodeContext::PrepMetadata {
                param_total,
                col_total,
                remaining_params,
                remaining_cols,
            },
            ServerMessage::ColumnDefinition(_),
        ) => {
            let (remaining_params, remaining_cols) = if *remaining_params > 0 {
                (*remaining_params - 1, *remaining_cols)
            } else {
                (*remaining_params, remaining_cols.saturating_sub(1))
            };
            let context = DecodeContext::PrepMetadata {
                param_total: *param_total,
                col_total: *col_total,
                remaining_params,
                remaining_cols,
            };
            if deprecate_eof && remaining_params == 0 && remaining_cols == 0 {
                done(context)
            } else {
                next(context)
            }
        }
        (
            DecodeContext::PrepMetadata {
                remaining_params,
                remaining_cols,
                ..
            },
            ServerMessage::Eof(_),
        ) => {
            // Separator after the parameter block, terminator after the
            // column block.
            if *remaining_params == 0 && *remaining_cols == 0 {
                done(DecodeContext::Command)
            } else {
                next(*context)
            }
        }

        (
            DecodeContext::ResultMetadata {
                col_total,
                remaining_cols,
            },
            ServerMessage::ColumnDefinition(_),
        ) => {
            let remaining = remaining_cols.saturating_sub(1);
            if remaining == 0 && deprecate_eof {
                next(DecodeContext::ResultRows {
                    cols: *col_total,
                    binary: rows_binary,
                })
            } else {
                next(DecodeContext::ResultMetadata {
                    col_total: *col_total,
                    remaining_cols: remaining,
                })
            }
        }
        (DecodeContext::ResultMetadata { col_total, .. }, ServerMessage::Eof(_)) => {
            next(DecodeContext::ResultRows {
                cols: *col_total,
                binary: rows_binary,
            })
        }

        (DecodeContext::ResultRows { .. }, ServerMessage::Row(_)) => next(*context),
        (DecodeContext::ResultRows { .. }, ServerMessage::Ok(ok)) => {
            if ok.has_more_results() {
                next(DecodeContext::Command)
            } else {
                done(DecodeContext::Command)
            }
        }
        (DecodeContext::ResultRows { .. }, ServerMessage::Eof(eof)) => {
            if eof.has_more_results() {
                next(DecodeContext::Command)
            } else {
                done(DecodeContext::Command)
            }
        }

        // An ERR terminates any exchange.
        (_, ServerMessage::Err(_)) => done(DecodeContext::Command),

        // Connection-phase messages never reach the engine; anything else
        // leaves the context alone.
        _ => next(*context),
    }
}

/// A connected MySQL client.
///
/// Cloning is cheap; all clones submit exchanges to the same connection
/// task, which serializes them in submission order.
#[derive(Clone)]
pub struct Client {
    exchanges: mpsc::Sender<Exchange>,
    info: Arc<ConnectionInfo>,
    zero_date: ZeroDate,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection_id", &self.info.connection_id)
            .field("server_version", &self.info.server_version)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect over TCP and run the handshake.
    pub async fn connect(config: Config) -> Result<Self> {
        let addr = config.socket_addr();
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| {
                let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    ConnectionErrorKind::Refused
                } else {
                    ConnectionErrorKind::Connect
                };
                Error::Connection(myflux_core::ConnectionError {
                    kind,
                    message: format!("failed to connect to {}: {}", addr, e),
                    source: Some(Box::new(e)),
                })
            })?;
        stream.set_nodelay(true).ok();

        Self::over_stream(Box::new(stream), config).await
    }

    /// Run the handshake over an already-established transport.
    ///
    /// Useful for Unix sockets, tunnels and in-memory test transports.
    pub async fn over_stream(
        stream: Box<dyn Transport>,
        config: Config,
    ) -> Result<Self> {
        let mut channel = Channel::new(stream);
        let mut session = Session::new(
            config.user.clone(),
            config.password.clone(),
            config.database.clone(),
        );

        handshake::establish(&mut channel, &config, &mut session).await?;

        let info = Arc::new(ConnectionInfo::from_session(&session));
        debug!(
            "connection {} ready, server {}",
            info.connection_id, info.server_version
        );

        let (exchanges, queue) = mpsc::channel(8);
        tokio::spawn(engine::run(channel, Arc::clone(&info), queue));

        Ok(Self {
            exchanges,
            info,
            zero_date: config.zero_date,
        })
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn connection_id(&self) -> u32 {
        self.info.connection_id
    }

    /// Execute a text-protocol query and collect every result window.
    ///
    /// Semicolon-joined batches (with `multi_statements`) produce one
    /// window per statement.
    pub async fn query(&self, sql: &str) -> Result<Vec<ResultSet>> {
        let responses = self
            .submit(
                vec![ClientMessage::Query(sql.to_string())],
                DecodeContext::Command,
                false,
                None,
            )
            .await?;
        collect_windows(responses, RowFormat::Text, self.zero_date, Some(sql)).await
    }

    /// Execute a statement and return its first result window.
    pub async fn execute(&self, sql: &str) -> Result<ResultSet> {
        let mut windows = self.query(sql).await?;
        if windows.is_empty() {
            return Err(Error::protocol(
                myflux_core::ProtocolErrorKind::NotSupported,
                "statement produced no result window",
            ));
        }
        Ok(windows.remove(0))
    }

    /// Execute a query and stream rows of its first result window.
    ///
    /// Dropping the stream cancels the exchange; the engine drains the
    /// remaining server messages before admitting the next request.
    pub async fn query_stream(&self, sql: &str) -> Result<QueryStream> {
        let responses = self
            .submit(
                vec![ClientMessage::Query(sql.to_string())],
                DecodeContext::Command,
                false,
                None,
            )
            .await?;
        Ok(QueryStream {
            responses,
            columns: Arc::from(Vec::<ColumnDefinition>::new()),
            metadata: None,
            pending_columns: Vec::new(),
            zero_date: self.zero_date,
            finished: false,
        })
    }

    /// Liveness probe.
    pub async fn ping(&self) -> Result<()> {
        let responses = self
            .submit(vec![ClientMessage::Ping], DecodeContext::Command, false, None)
            .await?;
        collect_windows(responses, RowFormat::Text, self.zero_date, None).await?;
        Ok(())
    }

    /// Switch the default schema.
    pub async fn use_database(&self, database: &str) -> Result<()> {
        let responses = self
            .submit(
                vec![ClientMessage::InitDb(database.to_string())],
                DecodeContext::Command,
                false,
                None,
            )
            .await?;
        collect_windows(responses, RowFormat::Text, self.zero_date, None).await?;
        Ok(())
    }

    /// Prepare a statement. `?` and `:name` markers are recognized.
    pub async fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        let parsed = ParsedQuery::parse(sql, false, self.info.no_backslash_escapes());

        let mut responses = self
            .submit(
                vec![ClientMessage::StmtPrepare(parsed.sql().to_string())],
                DecodeContext::WaitPrepare,
                false,
                None,
            )
            .await?;

        let mut prepared: Option<crate::message::PreparedOk> = None;
        let mut parameters = Vec::new();
        let mut columns = Vec::new();

        while let Some(item) = responses.recv().await {
            match item? {
                ServerMessage::PreparedOk(ok) => prepared = Some(ok),
                ServerMessage::ColumnDefinition(def) => {
                    let total_params = prepared.map_or(0, |p| usize::from(p.parameters));
                    if parameters.len() < total_params {
                        parameters.push(*def);
                    } else {
                        columns.push(*def);
                    }
                }
                ServerMessage::Eof(_) | ServerMessage::Ok(_) => {}
                ServerMessage::Err(err) => {
                    return Err(Error::Server(
                        err.into_server_error(Some(sql.to_string())),
                    ));
                }
                other => {
                    return Err(Error::protocol(
                        myflux_core::ProtocolErrorKind::UnknownHeader,
                        format!("unexpected {:?} while preparing", other),
                    ));
                }
            }
        }

        let prepared = prepared.ok_or_else(|| {
            Error::connection(
                ConnectionErrorKind::Disconnected,
                "connection closed while preparing statement",
            )
        })?;

        Ok(PreparedStatement {
            client: self.clone(),
            statement_id: prepared.statement_id,
            sql: sql.to_string(),
            parsed,
            parameters,
            columns,
            sent_types: Mutex::new(None),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Send COM_QUIT and shut the connection down.
    pub async fn close(self) -> Result<()> {
        let _ = self
            .exchanges
            .send(Exchange {
                messages: vec![ClientMessage::Quit],
                context: DecodeContext::Command,
                rows_binary: false,
                reset_on_error: None,
                responses: None,
            })
            .await;
        Ok(())
    }

    async fn submit(
        &self,
        messages: Vec<ClientMessage>,
        context: DecodeContext,
        rows_binary: bool,
        reset_on_error: Option<u32>,
    ) -> Result<mpsc::Receiver<Result<ServerMessage>>> {
        let (sender, receiver) = mpsc::channel(4);
        self.exchanges
            .send(Exchange {
                messages,
                context,
                rows_binary,
                reset_on_error,
                responses: Some(sender),
            })
            .await
            .map_err(|_| {
                Error::connection(
                    ConnectionErrorKind::Disconnected,
                    "connection task is gone",
                )
            })?;
        Ok(receiver)
    }

    fn submit_forget(&self, messages: Vec<ClientMessage>) {
        let _ = self.exchanges.try_send(Exchange {
            messages,
            context: DecodeContext::Command,
            rows_binary: false,
            reset_on_error: None,
            responses: None,
        });
    }
}

/// A prepared statement bound to its connection.
pub struct PreparedStatement {
    client: Client,
    statement_id: u32,
    sql: String,
    parsed: ParsedQuery,
    parameters: Vec<ColumnDefinition>,
    columns: Vec<ColumnDefinition>,
    /// Parameter types of the previous execution; a change forces a
    /// re-send of the type block.
    sent_types: Mutex<Option<Vec<(FieldType, bool)>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("statement_id", &self.statement_id)
            .field("sql", &self.sql)
            .field("parameters", &self.parameters.len())
            .field("columns", &self.columns.len())
            .finish()
    }
}

impl PreparedStatement {
    pub fn statement_id(&self) -> u32 {
        self.statement_id
    }

    pub fn parameter_count(&self) -> usize {
        self.parsed.placeholder_count()
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Fresh binding slots for one execution.
    pub fn bindings(&self) -> Bindings {
        Bindings::new(self.parsed.placeholder_count())
    }

    /// Positional indices a `:name` marker maps to.
    pub fn indexes_of(&self, name: &str) -> Option<&[usize]> {
        self.parsed.indexes_of(name)
    }

    /// Execute once with the given bindings.
    pub async fn execute(&self, bindings: Bindings) -> Result<ResultSet> {
        if bindings.len() != self.parsed.placeholder_count() {
            return Err(Error::Misuse(format!(
                "statement takes {} parameters, bindings carry {}",
                self.parsed.placeholder_count(),
                bindings.len()
            )));
        }
        let params = bindings.into_values()?;

        // Types are sent on the first execution and whenever the value
        // types change (a NULL in a previously non-NULL slot counts).
        let signature = param_type_signature(&params);
        let send_types = {
            let mut sent = self
                .sent_types
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let resend = sent.as_ref() != Some(&signature);
            if resend {
                *sent = Some(signature);
            }
            resend
        };

        let responses = self
            .client
            .submit(
                vec![ClientMessage::StmtExecute {
                    statement_id: self.statement_id,
                    params,
                    send_types,
                }],
                DecodeContext::Command,
                true,
                Some(self.statement_id),
            )
            .await?;

        let mut windows = collect_windows(
            responses,
            RowFormat::Binary,
            self.client.zero_date,
            Some(&self.sql),
        )
        .await?;
        if windows.is_empty() {
            return Err(Error::connection(
                ConnectionErrorKind::Disconnected,
                "connection closed during execution",
            ));
        }
        Ok(windows.remove(0))
    }

    /// Execute once per binding set, in order.
    pub async fn execute_batch(&self, batch: Vec<Bindings>) -> Result<Vec<ResultSet>> {
        if batch.is_empty() {
            return Err(Error::Misuse("no parameters bound for batch".into()));
        }
        let mut results = Vec::with_capacity(batch.len());
        for bindings in batch {
            results.push(self.execute(bindings).await?);
        }
        Ok(results)
    }

    /// Discard accumulated state server-side.
    pub async fn reset(&self) -> Result<()> {
        let responses = self
            .client
            .submit(
                vec![ClientMessage::StmtReset {
                    statement_id: self.statement_id,
                }],
                DecodeContext::Command,
                false,
                None,
            )
            .await?;
        collect_windows(responses, RowFormat::Text, self.client.zero_date, None).await?;
        Ok(())
    }

    /// Deallocate the statement. Fire-and-forget.
    pub async fn close(self) -> Result<()> {
        self.closed
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let _ = self
            .client
            .exchanges
            .send(Exchange {
                messages: vec![ClientMessage::StmtClose {
                    statement_id: self.statement_id,
                }],
                context: DecodeContext::Command,
                rows_binary: false,
                reset_on_error: None,
                responses: None,
            })
            .await;
        Ok(())
    }
}

impl Drop for PreparedStatement {
    fn drop(&mut self) {
        // Statement ids leak server-side unless released.
        if !self.closed.load(std::sync::atomic::Ordering::Relaxed) {
            self.client.submit_forget(vec![ClientMessage::StmtClose {
                statement_id: self.statement_id,
            }]);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowFormat {
    Text,
    Binary,
}

/// Collect every result window of one exchange.
async fn collect_windows(
    mut responses: mpsc::Receiver<Result<ServerMessage>>,
    format: RowFormat,
    zero_date: ZeroDate,
    sql: Option<&str>,
) -> Result<Vec<ResultSet>> {
    let mut windows = Vec::new();

    let mut pending_columns: Vec<ColumnDefinition> = Vec::new();
    let mut current: Option<(Arc<[ColumnDefinition]>, Arc<RowMetadata>, Vec<Row>)> = None;

    while let Some(item) = responses.recv().await {
        match item? {
            ServerMessage::Err(err) => {
                return Err(Error::Server(
                    err.into_server_error(sql.map(str::to_string)),
                ));
            }
            ServerMessage::ColumnCount(_) => pending_columns.clear(),
            ServerMessage::ColumnDefinition(def) => pending_columns.push(*def),
            ServerMessage::Eof(_) if current.is_none() => {
                // Metadata terminator: rows follow.
                current = Some(open_window(&mut pending_columns));
            }
            ServerMessage::Row(payload) => {
                // With DEPRECATE_EOF there is no metadata terminator; the
                // first row opens the window.
                if current.is_none() {
                    current = Some(open_window(&mut pending_columns));
                }
                let Some((columns, metadata, rows)) = current.as_mut() else {
                    continue;
                };
                let row = match format {
                    RowFormat::Text => {
                        decode_text_row(payload.fragments, columns, metadata, zero_date)?
                    }
                    RowFormat::Binary => {
                        decode_binary_row(payload.fragments, columns, metadata, zero_date)?
                    }
                };
                rows.push(row);
            }
            ServerMessage::Ok(ok) => {
                // Either an update count (no rows) or a row terminator.
                match current.take() {
                    Some((columns, metadata, rows)) => windows.push(ResultSet {
                        columns,
                        metadata: Some(metadata),
                        rows,
                        ok: Some(ok),
                    }),
                    None if !pending_columns.is_empty() => {
                        // DEPRECATE_EOF empty result: metadata then OK.
                        let (columns, metadata, rows) = open_window(&mut pending_columns);
                        windows.push(ResultSet {
                            columns,
                            metadata: Some(metadata),
                            rows,
                            ok: Some(ok),
                        });
                    }
                    None => windows.push(ResultSet {
                        ok: Some(ok),
                        ..ResultSet::default()
                    }),
                }
            }
            ServerMessage::Eof(eof) => {
                // Row terminator in the pre-deprecation shape.
                if let Some((columns, metadata, rows)) = current.take() {
                    windows.push(ResultSet {
                        columns,
                        metadata: Some(metadata),
                        rows,
                        ok: Some(crate::message::OkMessage {
                            status_flags: eof.status_flags,
                            warnings: eof.warnings,
                            ..Default::default()
                        }),
                    });
                }
            }
            other => {
                return Err(Error::protocol(
                    myflux_core::ProtocolErrorKind::UnknownHeader,
                    format!("unexpected {:?} in result flow", other),
                ));
            }
        }
    }

    Ok(windows)
}

fn open_window(
    pending: &mut Vec<ColumnDefinition>,
) -> (Arc<[ColumnDefinition]>, Arc<RowMetadata>, Vec<Row>) {
    let columns: Arc<[ColumnDefinition]> = Arc::from(std::mem::take(pending));
    let metadata = Arc::new(RowMetadata::new(
        columns.iter().map(|c| c.name.clone()).collect(),
    ));
    (columns, metadata, Vec::new())
}

/// Streaming rows of a query's first result window.
///
/// Dropping the stream before the terminator cancels the exchange.
pub struct QueryStream {
    responses: mpsc::Receiver<Result<ServerMessage>>,
    columns: Arc<[ColumnDefinition]>,
    metadata: Option<Arc<RowMetadata>>,
    pending_columns: Vec<ColumnDefinition>,
    zero_date: ZeroDate,
    finished: bool,
}

impl QueryStream {
    /// Next row, or `None` at the end of the window.
    pub async fn next_row(&mut self) -> Option<Result<Row>> {
        if self.finished {
            return None;
        }
        loop {
            let item = self.responses.recv().await?;
            let message = match item {
                Ok(message) => message,
                Err(error) => {
                    self.finished = true;
                    return Some(Err(error));
                }
            };
            match message {
                ServerMessage::ColumnCount(_) => self.pending_columns.clear(),
                ServerMessage::ColumnDefinition(def) => self.pending_columns.push(*def),
                ServerMessage::Eof(_) if self.metadata.is_none() => self.open_window(),
                ServerMessage::Row(payload) => {
                    if self.metadata.is_none() {
                        self.open_window();
                    }
                    let metadata = match self.metadata.as_ref() {
                        Some(metadata) => metadata,
                        None => continue,
                    };
                    return Some(decode_text_row(
                        payload.fragments,
                        &self.columns,
                        metadata,
                        self.zero_date,
                    ));
                }
                ServerMessage::Ok(_) | ServerMessage::Eof(_) => {
                    self.finished = true;
                    return None;
                }
                ServerMessage::Err(err) => {
                    self.finished = true;
                    return Some(Err(Error::Server(err.into_server_error(None))));
                }
                _ => {}
            }
        }
    }

    /// Column definitions, available once metadata has been read.
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    fn open_window(&mut self) {
        let columns: Arc<[ColumnDefinition]> =
            Arc::from(std::mem::take(&mut self.pending_columns));
        self.metadata = Some(Arc::new(RowMetadata::new(
            columns.iter().map(|c| c.name.clone()).collect(),
        )));
        self.columns = columns;
    }
}
