//! The connection engine: one task owns the socket, the framer, the
//! lifecycle phase, the query FIFOs, and the reuse cache.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Config;
use crate::conversion;
use crate::error::{Error, Result};
use crate::protocol::backend::{AuthRequest, BackendMessage};
use crate::protocol::framer::Framer;
use crate::protocol::frontend::{
    self, EncodedParam,
    auth::{SCRAM_SHA_256, ScramExchange},
};
use crate::protocol::types::{FormatCode, Oid, TransactionStatus};
use crate::query::{CachedStatement, PendingCache, Query, QueryOutput, Row};
use crate::value::PgValue;

use super::Shared;
use super::state::Phase;
use super::stream::Stream;

const READ_CHUNK: usize = 8 * 1024;

/// Caller-side commands delivered over the connection's channel.
pub(crate) enum Command {
    Open { reply: oneshot::Sender<Result<()>> },
    Enqueue(Box<Query>),
    Close,
}

enum Event {
    Command(Option<Command>),
    Read(std::io::Result<usize>),
}

pub(crate) struct ConnectionTask {
    cfg: Config,
    shared: Arc<Shared>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    done_tx: watch::Sender<bool>,

    stream: Option<Stream>,
    framer: Framer,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,

    phase: Phase,
    opened: bool,

    /// Main FIFO; transaction-bound queries wait in their own queue.
    queue: VecDeque<Box<Query>>,
    tx_queues: HashMap<u64, VecDeque<Box<Query>>>,
    finished_txs: HashSet<u64>,
    current_tx: Option<u64>,
    tx_failed: bool,

    /// Reuse cache: statement text → server-side prepared statement.
    cache: HashMap<String, CachedStatement>,
    name_counter: u64,

    scram: Option<ScramExchange>,
}

impl ConnectionTask {
    pub fn new(
        cfg: Config,
        shared: Arc<Shared>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        done_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            cfg,
            shared,
            cmd_rx,
            done_tx,
            stream: None,
            framer: Framer::new(),
            read_buf: vec![0; READ_CHUNK],
            write_buf: Vec::new(),
            phase: Phase::Closed,
            opened: false,
            queue: VecDeque::new(),
            tx_queues: HashMap::new(),
            finished_txs: HashSet::new(),
            current_tx: None,
            tx_failed: false,
            cache: HashMap::new(),
            name_counter: 0,
            scram: None,
        }
    }

    pub async fn run(mut self) {
        loop {
            // A dispatch-time failure completes on the next scheduler tick.
            if matches!(self.phase, Phase::DeferredFailure { .. }) {
                tokio::task::yield_now().await;
                if let Phase::DeferredFailure {
                    mut query,
                    error,
                    in_transaction,
                } = std::mem::replace(&mut self.phase, Phase::Closed)
                {
                    self.finish_query(&mut query, Err(error));
                    self.phase = if in_transaction {
                        Phase::ReadyInTransaction
                    } else {
                        Phase::Idle
                    };
                }
                continue;
            }

            self.pump();
            if matches!(self.phase, Phase::DeferredFailure { .. }) {
                continue;
            }

            if let Err(err) = self.flush_writes().await {
                self.shutdown(Some(err)).await;
                return;
            }

            let event = {
                let cmd_rx = &mut self.cmd_rx;
                let stream = self.stream.as_mut();
                let read_buf = &mut self.read_buf;
                tokio::select! {
                    cmd = cmd_rx.recv() => Event::Command(cmd),
                    result = async {
                        match stream {
                            Some(stream) => stream.read_chunk(read_buf).await,
                            None => std::future::pending().await,
                        }
                    } => Event::Read(result),
                }
            };

            match event {
                Event::Command(None) | Event::Command(Some(Command::Close)) => {
                    self.shutdown(None).await;
                    return;
                }
                Event::Command(Some(Command::Open { reply })) => {
                    if !self.handle_open(reply).await {
                        return;
                    }
                }
                Event::Command(Some(Command::Enqueue(query))) => self.route(query),
                Event::Read(Ok(0)) => {
                    self.shutdown(Some(Error::Protocol(
                        "connection closed by server".into(),
                    )))
                    .await;
                    return;
                }
                Event::Read(Ok(n)) => {
                    if let Err(err) = self.consume(n) {
                        self.shutdown(Some(err)).await;
                        return;
                    }
                }
                Event::Read(Err(err)) => {
                    self.shutdown(Some(err.into())).await;
                    return;
                }
            }
        }
    }

    // === Open ===

    /// Run the connect + handshake sequence. Returns false when the
    /// connection died and the task must exit.
    async fn handle_open(&mut self, reply: oneshot::Sender<Result<()>>) -> bool {
        if self.opened {
            let _ = reply.send(Err(Error::reopen()));
            return true;
        }
        self.opened = true;

        match timeout(self.cfg.timeout(), self.connect_and_authenticate()).await {
            Ok(Ok(())) => {
                debug!(
                    host = %self.cfg.host,
                    port = self.cfg.port,
                    database = %self.cfg.database,
                    "connection established"
                );
                let _ = reply.send(Ok(()));
                true
            }
            Ok(Err(err)) => {
                let _ = reply.send(Err(err));
                self.shutdown(None).await;
                false
            }
            Err(_elapsed) => {
                let _ = reply.send(Err(Error::Timeout(format!(
                    "Timed out trying to connect to {}:{}",
                    self.cfg.host, self.cfg.port
                ))));
                self.shutdown(None).await;
                false
            }
        }
    }

    async fn connect_and_authenticate(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.cfg.host, self.cfg.port);
        let tcp = TcpStream::connect(&addr).await?;
        tcp.set_nodelay(true)?;

        #[allow(unused_mut)]
        let mut stream = Stream::tcp(tcp);
        if self.cfg.use_ssl {
            #[cfg(feature = "tls")]
            {
                stream = negotiate_tls(stream, &self.cfg.host).await?;
            }
            #[cfg(not(feature = "tls"))]
            {
                return Err(Error::Config(
                    "use_ssl requires the `tls` cargo feature".into(),
                ));
            }
        }
        self.stream = Some(stream);

        let user = self.cfg.username.clone().unwrap_or_default();
        frontend::write_startup(
            &mut self.write_buf,
            &[
                ("user", user.as_str()),
                ("database", self.cfg.database.as_str()),
                ("client_encoding", "UTF8"),
                ("TimeZone", self.cfg.time_zone.as_str()),
            ],
        );
        self.flush_writes().await?;
        self.phase = Phase::SocketConnected;

        while self.phase.in_handshake() {
            let n = match self.stream.as_mut() {
                Some(stream) => stream.read_chunk(&mut self.read_buf).await?,
                None => return Err(Error::closed()),
            };
            if n == 0 {
                return Err(Error::Protocol("connection closed during startup".into()));
            }
            self.consume(n)?;
            self.flush_writes().await?;
        }
        Ok(())
    }

    // === Message handling ===

    fn consume(&mut self, n: usize) -> Result<()> {
        let mut messages = Vec::new();
        self.framer.feed(&self.read_buf[..n], &mut messages)?;
        for message in messages {
            self.on_message(message)?;
        }
        Ok(())
    }

    fn on_message(&mut self, message: BackendMessage) -> Result<()> {
        // Connection-wide messages, meaningful in every phase.
        match message {
            BackendMessage::ParameterStatus { name, value } => {
                debug!(%name, %value, "server parameter");
                self.shared.set_setting(name, value);
                return Ok(());
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.shared.process_id.store(process_id, Ordering::Release);
                self.shared.secret_key.store(secret_key, Ordering::Release);
                return Ok(());
            }
            BackendMessage::Notification(notification) => {
                let _ = self.shared.notify_tx.send(notification);
                return Ok(());
            }
            BackendMessage::Notice(notice) => {
                debug!(notice = %notice.message(), "server notice");
                return Ok(());
            }
            BackendMessage::Unknown { code, ref payload } => {
                warn!(
                    code = ?(code as char),
                    len = payload.len(),
                    "skipping unknown backend message"
                );
                return Ok(());
            }
            _ => {}
        }

        match self.phase {
            Phase::SocketConnected => self.on_startup_message(message),
            Phase::Authenticating | Phase::Authenticated => self.on_auth_message(message),
            Phase::Busy(_) => self.on_busy_message(message),
            Phase::Closed => Ok(()),
            _ => {
                debug!(?message, "backend message outside a request group");
                Ok(())
            }
        }
    }

    fn on_startup_message(&mut self, message: BackendMessage) -> Result<()> {
        match message {
            BackendMessage::Authentication(AuthRequest::Ok) => {
                self.phase = Phase::Authenticated;
                Ok(())
            }
            BackendMessage::Authentication(AuthRequest::CleartextPassword) => {
                let password = self.password()?;
                frontend::write_password(&mut self.write_buf, &password);
                self.phase = Phase::Authenticating;
                Ok(())
            }
            BackendMessage::Authentication(AuthRequest::Md5Password { salt }) => {
                let password = self.password()?;
                let user = self.cfg.username.clone().unwrap_or_default();
                let response = frontend::md5_password(&user, &password, &salt);
                frontend::write_password(&mut self.write_buf, &response);
                self.phase = Phase::Authenticating;
                Ok(())
            }
            BackendMessage::Authentication(AuthRequest::Sasl { mechanisms }) => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(Error::Auth(format!(
                        "no supported SASL mechanism, server offers {mechanisms:?}"
                    )));
                }
                let password = self.password()?;
                let scram = ScramExchange::new(&password);
                frontend::write_sasl_initial_response(
                    &mut self.write_buf,
                    SCRAM_SHA_256,
                    scram.client_first().as_bytes(),
                );
                self.scram = Some(scram);
                self.phase = Phase::Authenticating;
                Ok(())
            }
            BackendMessage::Error(err) => Err(Error::Auth(err.message().to_string())),
            other => {
                debug!(?other, "backend message ignored before authentication");
                Ok(())
            }
        }
    }

    fn on_auth_message(&mut self, message: BackendMessage) -> Result<()> {
        match message {
            BackendMessage::Authentication(AuthRequest::Ok) => {
                self.phase = Phase::Authenticated;
                Ok(())
            }
            BackendMessage::Authentication(AuthRequest::SaslContinue { data }) => {
                let scram = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("SASL continue without an exchange".into()))?;
                let server_first = simdutf8::compat::from_utf8(&data)
                    .map_err(|e| Error::Auth(format!("invalid server-first-message: {e}")))?;
                let response = scram.client_final(server_first).map_err(Error::Auth)?;
                frontend::write_sasl_response(&mut self.write_buf, response.as_bytes());
                Ok(())
            }
            BackendMessage::Authentication(AuthRequest::SaslFinal { data }) => {
                let scram = self
                    .scram
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("SASL final without an exchange".into()))?;
                let server_final = simdutf8::compat::from_utf8(&data)
                    .map_err(|e| Error::Auth(format!("invalid server-final-message: {e}")))?;
                scram.verify_server_final(server_final).map_err(Error::Auth)?;
                Ok(())
            }
            BackendMessage::ReadyForQuery(_) => {
                self.scram = None;
                self.phase = Phase::Idle;
                Ok(())
            }
            BackendMessage::Error(err) => Err(Error::Auth(err.message().to_string())),
            other => {
                debug!(?other, "backend message ignored during authentication");
                Ok(())
            }
        }
    }

    fn on_busy_message(&mut self, message: BackendMessage) -> Result<()> {
        // ReadyForQuery terminates the request group.
        if let BackendMessage::ReadyForQuery(status) = message {
            let Phase::Busy(query) = std::mem::replace(&mut self.phase, Phase::Closed) else {
                return Ok(());
            };
            self.on_query_done(query, status);
            return Ok(());
        }

        let Phase::Busy(query) = &mut self.phase else {
            return Ok(());
        };

        match message {
            BackendMessage::RowDescription(fields) => {
                query.fields = Some(Arc::from(fields));
                Ok(())
            }
            BackendMessage::ParameterDescription(server_oids) => {
                let declared: Vec<Oid> = query.declared_types.iter().map(|t| t.oid()).collect();
                let compatible = server_oids.len() == declared.len()
                    && server_oids.iter().zip(&declared).all(|(s, d)| s == d);
                if compatible {
                    if let Some(pending) = &mut query.pending_cache {
                        pending.validated = true;
                    }
                } else {
                    if let Some(pending) = query.pending_cache.take() {
                        self.cache.remove(&pending.key);
                    }
                    if query.failure.is_none() {
                        query.failure = Some(Error::InvalidType(format!(
                            "parameter types {declared:?} do not match server expectation {server_oids:?}"
                        )));
                    }
                }
                Ok(())
            }
            BackendMessage::DataRow(columns) => {
                if query.only_affected {
                    return Ok(());
                }
                let Some(fields) = query.fields.clone() else {
                    if query.failure.is_none() {
                        query.failure =
                            Some(Error::Protocol("DataRow before RowDescription".into()));
                    }
                    return Ok(());
                };
                let mut values = Vec::with_capacity(columns.len());
                for (column, field) in columns.iter().zip(fields.iter()) {
                    match column {
                        None => values.push(PgValue::Null),
                        Some(bytes) => match conversion::decode(
                            field.type_oid,
                            query.result_format,
                            bytes,
                            &self.cfg.decoders,
                        ) {
                            Ok(value) => values.push(value),
                            Err(err) => {
                                if query.failure.is_none() {
                                    query.failure = Some(err);
                                }
                                return Ok(());
                            }
                        },
                    }
                }
                query.rows.push(Row::new(fields, values));
                Ok(())
            }
            BackendMessage::CommandComplete { rows_affected } => {
                query.affected = rows_affected;
                Ok(())
            }
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::EmptyQueryResponse => Ok(()),
            BackendMessage::Error(err) => {
                if err.is_fatal() {
                    // The backend is gone; the run loop tears the connection
                    // down and this error reaches the in-flight query.
                    return Err(Error::Server(err));
                }
                // Hold the error until ReadyForQuery drains the group.
                if query.failure.is_none() {
                    query.failure = Some(Error::Server(err));
                }
                Ok(())
            }
            other => {
                debug!(?other, "unexpected backend message while busy");
                Ok(())
            }
        }
    }

    fn on_query_done(&mut self, mut query: Box<Query>, status: TransactionStatus) {
        if query.failure.is_none()
            && let Some(pending) = query.pending_cache.take()
            && pending.validated
        {
            let fields = query.fields.clone().unwrap_or_else(|| Arc::from(Vec::new()));
            self.cache.insert(
                pending.key,
                CachedStatement {
                    name: pending.name,
                    param_types: pending.param_types,
                    fields,
                },
            );
        }

        let result = match query.failure.take() {
            Some(err) => Err(err),
            None if query.only_affected => Ok(QueryOutput::Affected(query.affected)),
            None => Ok(QueryOutput::Rows(std::mem::take(&mut query.rows))),
        };
        self.finish_query(&mut query, result);

        match status {
            TransactionStatus::Idle => {
                self.phase = Phase::Idle;
                self.end_transaction();
            }
            TransactionStatus::InTransaction => {
                if query.tx.is_some() {
                    self.current_tx = query.tx;
                }
                self.phase = Phase::ReadyInTransaction;
            }
            TransactionStatus::Failed => {
                if query.tx.is_some() {
                    self.current_tx = query.tx;
                }
                self.tx_failed = true;
                self.phase = Phase::TransactionFailure;
            }
        }
    }

    // === Dispatch ===

    fn route(&mut self, mut query: Box<Query>) {
        if let Some(id) = query.tx
            && !query.begins_tx
        {
            if self.finished_txs.contains(&id) {
                self.finish_query(&mut query, Err(Error::cancelled()));
                return;
            }
            self.tx_queues.entry(id).or_default().push_back(query);
            return;
        }
        self.queue.push_back(query);
    }

    /// Dispatch the next pending query if the connection is ready for one.
    fn pump(&mut self) {
        loop {
            match self.phase {
                Phase::Idle => {
                    let Some(query) = self.queue.pop_front() else {
                        return;
                    };
                    self.dispatch(query, false);
                    return;
                }
                Phase::TransactionFailure => {
                    // The next awake returns to ReadyInTransaction so the
                    // transaction can emit its rollback.
                    let has_work = self
                        .current_tx
                        .and_then(|id| self.tx_queues.get(&id))
                        .is_some_and(|queue| !queue.is_empty());
                    if !has_work {
                        return;
                    }
                    self.phase = Phase::ReadyInTransaction;
                }
                Phase::ReadyInTransaction => {
                    let Some(id) = self.current_tx else {
                        // Transaction block opened with raw SQL; serve the
                        // main FIFO.
                        let Some(query) = self.queue.pop_front() else {
                            return;
                        };
                        self.dispatch(query, true);
                        return;
                    };
                    let Some(query) = self.tx_queues.get_mut(&id).and_then(VecDeque::pop_front)
                    else {
                        return;
                    };
                    if self.tx_failed && !query.tx_control {
                        let mut query = query;
                        self.finish_query(
                            &mut query,
                            Err(Error::Transaction(
                                "transaction marked for rollback, query discarded".into(),
                            )),
                        );
                        continue;
                    }
                    self.dispatch(query, true);
                    return;
                }
                _ => return,
            }
        }
    }

    fn dispatch(&mut self, mut query: Box<Query>, in_transaction: bool) {
        match self.serialize(&mut query) {
            Ok(()) => {
                debug!(statement = %query.statement, "query dispatched");
                self.phase = Phase::Busy(query);
            }
            Err(error) => {
                self.phase = Phase::DeferredFailure {
                    query,
                    error,
                    in_transaction,
                };
            }
        }
    }

    /// Serialize a query into the write buffer: a Simple Query for the
    /// affected-rows path, Parse(+Describe)+Bind+Execute+Sync otherwise,
    /// consulting the reuse cache.
    fn serialize(&mut self, query: &mut Query) -> Result<()> {
        if query.only_affected {
            let sql = self.cfg.substitutor.literal(&query.statement, &query.params)?;
            query.result_format = FormatCode::Text;
            frontend::write_query(&mut self.write_buf, &sql);
            return Ok(());
        }

        let (sql, parameters) = self.cfg.substitutor.extended(&query.statement, &query.params)?;
        query.declared_types = parameters.iter().map(|p| p.ty).collect();
        query.result_format = FormatCode::Binary;

        let mut encoded = Vec::with_capacity(parameters.len());
        for parameter in &parameters {
            encoded.push(EncodedParam {
                format: FormatCode::Binary,
                bytes: conversion::encode(&parameter.value, parameter.ty)?,
            });
        }

        if !query.allow_reuse {
            // One-shot: unnamed statement, nothing cached.
            frontend::write_parse(&mut self.write_buf, "", &sql);
            frontend::write_describe_statement(&mut self.write_buf, "");
            frontend::write_bind(&mut self.write_buf, "", &encoded);
            frontend::write_execute(&mut self.write_buf);
            frontend::write_sync(&mut self.write_buf);
            return Ok(());
        }

        if let Some(cached) = self.cache.get(&query.statement) {
            if cached.param_types == query.declared_types {
                // Server already parsed this statement: skip Parse+Describe.
                query.fields = Some(cached.fields.clone());
                frontend::write_bind(&mut self.write_buf, &cached.name, &encoded);
                frontend::write_execute(&mut self.write_buf);
                frontend::write_sync(&mut self.write_buf);
                return Ok(());
            }
            self.cache.remove(&query.statement);
        }

        self.name_counter += 1;
        let name = format!("{:012}", self.name_counter);
        query.pending_cache = Some(PendingCache {
            key: query.statement.clone(),
            name: name.clone(),
            param_types: query.declared_types.clone(),
            validated: false,
        });
        frontend::write_parse(&mut self.write_buf, &name, &sql);
        frontend::write_describe_statement(&mut self.write_buf, &name);
        frontend::write_bind(&mut self.write_buf, &name, &encoded);
        frontend::write_execute(&mut self.write_buf);
        frontend::write_sync(&mut self.write_buf);
        Ok(())
    }

    // === Teardown ===

    async fn shutdown(&mut self, error: Option<Error>) {
        if let Some(err) = &error {
            warn!(%err, "connection closing");
        }

        // Best-effort clean Terminate.
        if let Some(stream) = self.stream.as_mut() {
            let mut buf = Vec::new();
            frontend::write_terminate(&mut buf);
            let _ = stream.write_all(&buf).await;
            let _ = stream.flush().await;
        }
        self.stream = None;
        self.write_buf.clear();

        // Completions are deferred one tick so a caller never observes them
        // synchronously while an inbound byte is mid-processing.
        tokio::task::yield_now().await;

        let mut error = error;
        match std::mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Busy(mut query) => {
                let err = error.take().unwrap_or_else(Error::cancelled);
                self.finish_query(&mut query, Err(err));
            }
            Phase::DeferredFailure {
                mut query,
                error: deferred,
                ..
            } => {
                self.finish_query(&mut query, Err(deferred));
            }
            _ => {}
        }

        let queued: Vec<_> = self.queue.drain(..).collect();
        for mut query in queued {
            self.finish_query(&mut query, Err(Error::cancelled()));
        }
        let tx_ids: Vec<u64> = self.tx_queues.keys().copied().collect();
        for id in tx_ids {
            if let Some(queue) = self.tx_queues.remove(&id) {
                for mut query in queue {
                    self.finish_query(&mut query, Err(Error::cancelled()));
                }
            }
        }

        // Commands that raced the close: these were issued at or after the
        // teardown, so they observe the closed connection rather than the
        // queue-wide cancellation.
        self.cmd_rx.close();
        while let Ok(command) = self.cmd_rx.try_recv() {
            match command {
                Command::Open { reply } => {
                    let _ = reply.send(Err(Error::reopen()));
                }
                Command::Enqueue(mut query) => {
                    self.finish_query(&mut query, Err(Error::closed()));
                }
                Command::Close => {}
            }
        }

        let _ = self.done_tx.send(true);
    }

    // === Helpers ===

    fn end_transaction(&mut self) {
        self.tx_failed = false;
        if let Some(id) = self.current_tx.take() {
            self.finished_txs.insert(id);
            if let Some(queue) = self.tx_queues.remove(&id) {
                for mut query in queue {
                    self.finish_query(&mut query, Err(Error::cancelled()));
                }
            }
        }
    }

    fn finish_query(&mut self, query: &mut Query, result: Result<QueryOutput>) {
        if !query.is_completed() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            query.complete(result);
        }
    }

    async fn flush_writes(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let Some(stream) = self.stream.as_mut() else {
            self.write_buf.clear();
            return Ok(());
        };
        let buf = std::mem::take(&mut self.write_buf);
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }

    fn password(&self) -> Result<String> {
        self.cfg
            .password
            .clone()
            .ok_or_else(|| Error::Auth("password required but not provided".into()))
    }
}

/// Send the SSL request preamble and upgrade the socket when accepted.
#[cfg(feature = "tls")]
async fn negotiate_tls(mut stream: Stream, host: &str) -> Result<Stream> {
    let mut buf = Vec::new();
    frontend::write_ssl_request(&mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await?;

    match stream.read_u8().await? {
        b'S' => stream.upgrade_to_tls(host).await,
        b'N' => Err(Error::Protocol(
            "server does not support SSL connections".into(),
        )),
        other => Err(Error::Protocol(format!(
            "unexpected SSL negotiation response: {other:#04x}"
        ))),
    }
}
