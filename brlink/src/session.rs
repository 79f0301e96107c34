//! Device session: identify handshake, then one command in flight at a time.
//!
//! A session owns one [`TransportHandle`] and one [`Model`]. It moves from
//! `Disconnected` to `Probing` while identifying, to `Ready` once a profile
//! is known, and back to `Disconnected` on close, on a dead transport, or
//! when the device stops answering.
//!
//! Nothing runs in the background. The caller drives the session by calling
//! [`Session::poll_commands`] on a fixed cadence and [`Session::flush`] when
//! the content changes; all waiting happens inside bounded transport reads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cells::{CellBuffer, Span};
use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::keys::{KeyDecoder, NormalizedCommand};
use crate::model::{DeviceProfile, Inbound, Model, ModelRegistry, ModelTiming};
use crate::protocol::{Decoded, PacketCodec};
use crate::tracing::prelude::*;
use crate::transport::{self, TransportDescriptor, TransportHandle};

const READ_BUFFER: usize = 512;

/// Session tuning. Every value has a default, so an empty table is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Override the model's identify timeout.
    pub identify_timeout_ms: Option<u64>,
    /// Override the model's identify retry count.
    pub identify_retries: Option<u32>,
    /// Override the model's acknowledgement timeout.
    pub ack_timeout_ms: Option<u64>,
    /// Override the model's key poll interval.
    pub poll_interval_ms: Option<u64>,
    /// Poll for keys on models that need it.
    pub polling: bool,
    /// Resends of a timed-out write before the span is rolled back.
    pub write_retries: u32,
    /// Consecutive timeouts tolerated before the device is declared gone.
    pub unresponsive_after: u32,
    /// Pause before the full redraw that follows an abandoned write.
    pub retry_cooldown_ms: u64,
    /// Gap allowed between bytes of one read.
    pub read_subsequent_ms: u64,
    /// Unchanged cells folded into a write to save packets.
    pub merge_gap: usize,
    /// Consecutive rejected packets tolerated. Unbounded when unset.
    pub max_protocol_errors: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identify_timeout_ms: None,
            identify_retries: None,
            ack_timeout_ms: None,
            poll_interval_ms: None,
            polling: true,
            write_retries: 2,
            unresponsive_after: 5,
            retry_cooldown_ms: 1000,
            read_subsequent_ms: 20,
            merge_gap: 2,
            max_protocol_errors: None,
        }
    }
}

impl SessionConfig {
    /// The model's timing with configured overrides applied.
    pub fn timing(&self, model: ModelTiming) -> ModelTiming {
        ModelTiming {
            identify_timeout: self
                .identify_timeout_ms
                .map_or(model.identify_timeout, Duration::from_millis),
            identify_retries: self.identify_retries.unwrap_or(model.identify_retries),
            ack_timeout: self.ack_timeout_ms.map_or(model.ack_timeout, Duration::from_millis),
            poll_interval: match self.poll_interval_ms {
                Some(ms) => model.poll_interval.map(|_| Duration::from_millis(ms)),
                None => model.poll_interval,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Disconnected,
    Probing,
    Ready,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_in: u64,
    pub packets_out: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub protocol_errors: u64,
    pub device_errors: u64,
    pub commands: u64,
}

#[derive(Debug, Clone)]
enum PendingKind {
    Write { span: Span, cells: Bytes },
    Poll,
}

#[derive(Debug, Clone)]
struct PendingCommand {
    kind: PendingKind,
    wire: Bytes,
    issued: Instant,
    deadline: Instant,
    attempts: u32,
}

pub struct Session {
    transport: TransportHandle,
    model: Arc<dyn Model>,
    codec: PacketCodec,
    config: SessionConfig,
    timing: ModelTiming,
    state: SessionState,
    profile: Option<DeviceProfile>,
    cells: Option<CellBuffer>,
    image: Vec<u8>,
    dirty: bool,
    decoder: Option<KeyDecoder>,
    pending: Option<PendingCommand>,
    queue: VecDeque<(Span, Bytes)>,
    commands: Vec<NormalizedCommand>,
    timeouts_in_row: u32,
    protocol_errors_in_row: u32,
    naks_in_row: u32,
    /// Acknowledgements still owed for earlier copies of a resent write,
    /// and until when they are expected.
    owed_acks: Option<(u32, Instant)>,
    redraw_after: Option<Instant>,
    last_poll: Option<Instant>,
    window_offset: usize,
    stats: SessionStats,
}

impl Session {
    /// Open the channel and identify the display.
    ///
    /// With a model hint only that model is tried. Without one, every
    /// registered model is tried in registry order and the first to answer
    /// its identify request wins.
    pub async fn connect(
        descriptor: &TransportDescriptor,
        hint: Option<&str>,
        config: SessionConfig,
    ) -> Result<Session> {
        let models: Vec<Arc<dyn Model>> = match hint {
            Some(name) => {
                let desc = ModelRegistry::find(name)
                    .ok_or_else(|| Error::Config(format!("unknown model {name:?}")))?;
                vec![(desc.create)()]
            }
            None => ModelRegistry::all().iter().map(|desc| (desc.create)()).collect(),
        };

        let transport = transport::open(descriptor).await?;
        Self::detect(transport, models, config).await
    }

    /// Identify the display on an open channel, trying `models` in order.
    pub async fn detect(
        transport: TransportHandle,
        models: Vec<Arc<dyn Model>>,
        config: SessionConfig,
    ) -> Result<Session> {
        let mut models = models.into_iter().peekable();
        let Some(first) = models.next() else {
            return Err(Error::Config("no display models available".into()));
        };

        let mut session = Session::new(transport, first, config);
        loop {
            let Some(next) = models.peek().cloned() else {
                session.probe().await?;
                return Ok(session);
            };
            match session.identify().await {
                Ok(_) => return Ok(session),
                Err(Error::Unresponsive(attempts)) => {
                    debug!(model = session.model.name(), attempts, "No answer, trying next model");
                    models.next();
                    session.use_model(next);
                }
                Err(e) => {
                    session.shutdown().await;
                    return Err(e);
                }
            }
        }
    }

    pub fn new(transport: TransportHandle, model: Arc<dyn Model>, config: SessionConfig) -> Self {
        let timing = config.timing(model.timing());
        Self {
            transport,
            codec: PacketCodec::new(model.grammar()),
            model,
            config,
            timing,
            state: SessionState::Disconnected,
            profile: None,
            cells: None,
            image: Vec::new(),
            dirty: false,
            decoder: None,
            pending: None,
            queue: VecDeque::new(),
            commands: Vec::new(),
            timeouts_in_row: 0,
            protocol_errors_in_row: 0,
            naks_in_row: 0,
            owed_acks: None,
            redraw_after: None,
            last_poll: None,
            window_offset: 0,
            stats: SessionStats::default(),
        }
    }

    /// Switch to another model before identifying.
    pub fn use_model(&mut self, model: Arc<dyn Model>) {
        self.timing = self.config.timing(model.timing());
        self.codec = PacketCodec::new(model.grammar());
        self.model = model;
    }

    pub fn model(&self) -> &Arc<dyn Model> {
        &self.model
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn profile(&self) -> Option<&DeviceProfile> {
        self.profile.as_ref()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Whether content is waiting to be written.
    pub fn is_dirty(&self) -> bool {
        self.dirty || !self.queue.is_empty() || self.pending.is_some()
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Token that closes the transport from another task.
    pub fn close_handle(&self) -> CancellationToken {
        self.transport.close_token()
    }

    pub fn into_transport(self) -> TransportHandle {
        self.transport
    }

    /// Cell of the source text shown in the leftmost display cell.
    pub fn set_window_offset(&mut self, offset: usize) {
        self.window_offset = offset;
        if let Some(decoder) = &mut self.decoder {
            decoder.set_window_offset(offset);
        }
    }

    /// Identify, closing the session if the display does not answer.
    pub async fn probe(&mut self) -> Result<DeviceProfile> {
        match self.identify().await {
            Ok(profile) => Ok(profile),
            Err(e) => {
                self.shutdown().await;
                Err(e)
            }
        }
    }

    /// Run the identify exchange with the current model.
    ///
    /// Sends the identify request up to `identify_retries + 1` times. An
    /// attempt ends on timeout, or on a read that holds other packets but no
    /// valid identity.
    /// On `Unresponsive` the transport stays open so another model can be
    /// tried; a transport failure closes the session.
    pub async fn identify(&mut self) -> Result<DeviceProfile> {
        self.transport_alive()?;
        self.state = SessionState::Probing;
        self.codec.reset();

        let wire = self.model.grammar().frame(&self.model.identify_request())?;
        let attempts = self.timing.identify_retries + 1;

        for attempt in 1..=attempts {
            debug!(model = self.model.name(), attempt, attempts, "Sending identify");
            if attempt > 1 {
                self.stats.retries += 1;
            }
            self.send_wire(&wire).await?;

            let deadline = Instant::now() + self.timing.identify_timeout;
            if let Some(profile) = self.await_identity(deadline).await? {
                self.become_ready(profile.clone());
                return Ok(profile);
            }
        }

        warn!(model = self.model.name(), attempts, "Display did not identify");
        self.state = SessionState::Disconnected;
        Err(Error::Unresponsive(attempts))
    }

    async fn await_identity(&mut self, deadline: Instant) -> Result<Option<DeviceProfile>> {
        let mut buf = [0u8; READ_BUFFER];
        let subsequent = Duration::from_millis(self.config.read_subsequent_ms);

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let n = match self.transport.read(&mut buf, deadline - now, subsequent).await {
                Ok(n) => n,
                Err(TransportError::Timeout) => return Ok(None),
                Err(e) => return Err(self.transport_failed(e).await),
            };

            // An identity anywhere in the read wins over packets before it.
            let mut mismatched = false;
            for decoded in self.codec.feed(&buf[..n]) {
                match decoded {
                    Decoded::Packet(payload) => {
                        self.stats.packets_in += 1;
                        match self.model.interpret(&payload, Instant::now()) {
                            Inbound::Identity(profile) => return Ok(Some(profile)),
                            other => {
                                debug!(packet = ?other, "Unexpected packet while identifying");
                                mismatched = true;
                            }
                        }
                    }
                    Decoded::Rejected(e) => {
                        self.stats.protocol_errors += 1;
                        debug!(error = %e, "Bad packet while identifying");
                        mismatched = true;
                    }
                }
            }
            if mismatched {
                return Ok(None);
            }
        }
    }

    fn become_ready(&mut self, profile: DeviceProfile) {
        let mut cells = CellBuffer::new(profile.cells(), self.model.write_alignment(&profile))
            .with_merge_gap(self.config.merge_gap);
        cells.force_full();

        let mut decoder = KeyDecoder::new(profile.key_table.clone());
        decoder.set_window_offset(self.window_offset);

        info!(
            model = self.model.name(),
            transport = %self.transport.describe(),
            display = %profile,
            "Display ready"
        );

        self.image = vec![0; profile.cells()];
        self.cells = Some(cells);
        self.decoder = Some(decoder);
        self.profile = Some(profile);
        self.dirty = true;
        self.pending = None;
        self.queue.clear();
        self.timeouts_in_row = 0;
        self.protocol_errors_in_row = 0;
        self.naks_in_row = 0;
        self.owed_acks = None;
        self.redraw_after = None;
        self.last_poll = None;
        self.state = SessionState::Ready;
    }

    /// Close the transport. The session ends up `Disconnected`.
    pub async fn disconnect(&mut self) {
        if self.state != SessionState::Disconnected || !self.transport.is_closed() {
            info!(transport = %self.transport.describe(), "Disconnecting");
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        self.transport.close().await;
        if self.state != SessionState::Disconnected {
            debug!(stats = ?self.stats, "Session closed");
        }
        self.state = SessionState::Disconnected;
        self.pending = None;
        self.owed_acks = None;
        self.queue.clear();
        self.codec.reset();
        if let Some(decoder) = &mut self.decoder {
            decoder.reset();
        }
    }

    fn transport_alive(&self) -> Result<()> {
        if self.transport.is_closed() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    async fn transport_failed(&mut self, err: TransportError) -> Error {
        warn!(error = %err, "Transport failed, disconnecting");
        self.shutdown().await;
        Error::Transport(err)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    /// Set the full target image, `columns * rows` cells.
    pub fn set_cell_image(&mut self, image: &[u8]) -> Result<()> {
        self.ensure_ready()?;
        if image.len() != self.image.len() {
            return Err(Error::ImageSize {
                expected: self.image.len(),
                actual: image.len(),
            });
        }
        if image != self.image.as_slice() {
            self.image.copy_from_slice(image);
            self.dirty = true;
        }
        Ok(())
    }

    /// Queue writes for whatever changed and send the first one if the
    /// device is idle.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_ready()?;
        if !self.cooling_down() {
            self.stage_image()?;
        }
        if self.pending.is_none() {
            self.send_next_write().await?;
        }
        Ok(())
    }

    /// Process input, retry or escalate an overdue command, send the next
    /// queued write or a key poll, and return decoded commands.
    pub async fn poll_commands(&mut self) -> Result<Vec<NormalizedCommand>> {
        self.ensure_ready()?;
        self.drain().await?;
        self.check_deadline().await?;
        self.pump().await?;
        Ok(mem::take(&mut self.commands))
    }

    fn cooling_down(&mut self) -> bool {
        match self.redraw_after {
            Some(at) if Instant::now() < at => true,
            Some(_) => {
                self.redraw_after = None;
                info!("Redrawing display after failed write");
                false
            }
            None => false,
        }
    }

    fn stage_image(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let (Some(cells), Some(profile)) = (&mut self.cells, &self.profile) else {
            return Err(Error::NotConnected);
        };

        let spans = cells.update(&self.image)?;
        self.dirty = false;

        let max = self.model.max_write_cells(profile);
        for span in spans.into_iter().flat_map(|s| s.chunks(max)) {
            // A queued write wholly covered by this one is superseded.
            self.queue
                .retain(|(queued, _)| !(queued.start >= span.start && queued.end() <= span.end()));
            let data = Bytes::copy_from_slice(&self.image[span.range()]);
            trace!(start = span.start, len = span.len, "Queued write");
            self.queue.push_back((span, data));
        }
        Ok(())
    }

    async fn send_next_write(&mut self) -> Result<()> {
        let Some((span, data)) = self.queue.pop_front() else {
            return Ok(());
        };
        let Some(profile) = &self.profile else {
            return Err(Error::NotConnected);
        };
        let payload = self.model.write_request(profile, span, &data);
        self.issue(PendingKind::Write { span, cells: data }, payload)
            .await
    }

    async fn pump(&mut self) -> Result<()> {
        if self.pending.is_some() {
            return Ok(());
        }
        if !self.cooling_down() {
            self.stage_image()?;
            if !self.queue.is_empty() {
                return self.send_next_write().await;
            }
        }

        if !self.config.polling {
            return Ok(());
        }
        let (Some(interval), Some(request)) = (self.timing.poll_interval, self.model.poll_request())
        else {
            return Ok(());
        };
        let now = Instant::now();
        if self.last_poll.is_some_and(|last| now.duration_since(last) < interval) {
            return Ok(());
        }
        self.last_poll = Some(now);
        self.issue(PendingKind::Poll, request).await
    }

    async fn issue(&mut self, kind: PendingKind, payload: Bytes) -> Result<()> {
        let wire = self.model.grammar().frame(&payload)?;
        self.send_wire(&wire).await?;
        let now = Instant::now();
        self.pending = Some(PendingCommand {
            kind,
            wire,
            issued: now,
            deadline: now + self.timing.ack_timeout,
            attempts: 1,
        });
        Ok(())
    }

    async fn resend(&mut self, mut pending: PendingCommand) -> Result<()> {
        self.stats.retries += 1;
        self.send_wire(&pending.wire).await?;
        pending.attempts += 1;
        pending.deadline = Instant::now() + self.timing.ack_timeout;
        self.pending = Some(pending);
        Ok(())
    }

    async fn send_wire(&mut self, wire: &[u8]) -> Result<()> {
        match self.transport.write(wire).await {
            Ok(_) => {
                self.stats.packets_out += 1;
                Ok(())
            }
            Err(e) => Err(self.transport_failed(e).await),
        }
    }

    async fn drain(&mut self) -> Result<()> {
        let mut buf = [0u8; READ_BUFFER];
        let subsequent = Duration::from_millis(self.config.read_subsequent_ms);

        loop {
            let n = match self.transport.read(&mut buf, Duration::ZERO, subsequent).await {
                Ok(n) => n,
                Err(TransportError::Timeout) => return Ok(()),
                Err(e) => return Err(self.transport_failed(e).await),
            };
            for decoded in self.codec.feed(&buf[..n]) {
                self.handle(decoded).await?;
                if self.state != SessionState::Ready {
                    return Ok(());
                }
            }
            if n < buf.len() {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, decoded: Decoded) -> Result<()> {
        let payload = match decoded {
            Decoded::Packet(payload) => payload,
            Decoded::Rejected(e) => return self.protocol_error(e).await,
        };

        self.stats.packets_in += 1;
        let inbound = self.model.interpret(&payload, Instant::now());
        if let Inbound::Malformed(e) = inbound {
            return self.protocol_error(e).await;
        }
        self.protocol_errors_in_row = 0;
        self.timeouts_in_row = 0;

        match inbound {
            Inbound::Acknowledged => self.acknowledged(),
            Inbound::Rejected { code } => self.device_rejected(code).await?,
            Inbound::Keys(events) => {
                if matches!(self.pending, Some(PendingCommand { kind: PendingKind::Poll, .. })) {
                    self.pending = None;
                }
                if let Some(decoder) = &mut self.decoder {
                    for event in &events {
                        let commands = decoder.decode(event);
                        self.stats.commands += commands.len() as u64;
                        self.commands.extend(commands);
                    }
                }
            }
            Inbound::Identity(profile) => {
                let same_geometry = self.profile.as_ref().is_some_and(|p| {
                    p.columns == profile.columns && p.rows == profile.rows
                });
                if same_geometry {
                    info!("Display identified again, redrawing");
                    if let Some(cells) = &mut self.cells {
                        cells.force_full();
                    }
                    self.dirty = true;
                } else {
                    self.become_ready(profile);
                }
            }
            Inbound::Info(text) => info!(model = self.model.name(), "Display: {text}"),
            Inbound::Unknown(kind) => debug!("Ignoring packet type {kind:#04x}"),
            Inbound::Malformed(_) => {}
        }
        Ok(())
    }

    fn acknowledged(&mut self) {
        // Acknowledgements owed by earlier copies of a resent write must not
        // confirm the next write.
        if let Some((owed, until)) = self.owed_acks.take() {
            if Instant::now() < until {
                trace!(owed, "Dropping acknowledgement of an earlier copy");
                if owed > 1 {
                    self.owed_acks = Some((owed - 1, until));
                }
                return;
            }
        }

        match self.pending.take() {
            Some(PendingCommand {
                kind: PendingKind::Write { span, cells },
                issued,
                attempts,
                ..
            }) => {
                trace!(
                    start = span.start,
                    len = span.len,
                    attempts,
                    elapsed_ms = issued.elapsed().as_millis() as u64,
                    "Write acknowledged"
                );
                if let Some(buffer) = &mut self.cells {
                    buffer.acknowledge(span, &cells);
                }
                self.naks_in_row = 0;
                if attempts > 1 {
                    let until = Instant::now() + self.timing.ack_timeout;
                    self.owed_acks = Some((attempts - 1, until));
                }
            }
            other => {
                debug!("Acknowledgement with no write outstanding");
                self.pending = other;
            }
        }
    }

    async fn device_rejected(&mut self, code: u8) -> Result<()> {
        self.stats.device_errors += 1;
        let Some(pending) = self.pending.take() else {
            warn!(code, "Device reported failure with nothing outstanding");
            return Ok(());
        };

        match pending.kind {
            PendingKind::Write { span, .. } => {
                self.naks_in_row += 1;
                if self.naks_in_row == 1 {
                    warn!(code, start = span.start, "Write refused, resending");
                    self.resend(pending).await?;
                } else {
                    warn!(code, "Write refused again, redrawing");
                    self.naks_in_row = 0;
                    self.abandon_writes(span);
                }
            }
            PendingKind::Poll => {
                debug!(code, "Poll refused");
            }
        }
        Ok(())
    }

    async fn protocol_error(&mut self, err: ProtocolError) -> Result<()> {
        self.stats.protocol_errors += 1;
        self.protocol_errors_in_row += 1;
        warn!(error = %err, in_row = self.protocol_errors_in_row, "Discarded packet");

        if matches!(err, ProtocolError::ChecksumMismatch { .. }) {
            if let Some(cells) = &mut self.cells {
                cells.force_full();
            }
            self.dirty = true;
        }

        if let Some(max) = self.config.max_protocol_errors {
            if self.protocol_errors_in_row >= max {
                error!(errors = self.protocol_errors_in_row, "Too many bad packets, disconnecting");
                self.shutdown().await;
                return Err(Error::Protocol(err));
            }
        }
        Ok(())
    }

    async fn check_deadline(&mut self) -> Result<()> {
        let now = Instant::now();
        let Some(pending) = self.pending.take_if(|p| now >= p.deadline) else {
            return Ok(());
        };

        self.stats.timeouts += 1;
        self.timeouts_in_row += 1;
        if self.timeouts_in_row > self.config.unresponsive_after {
            error!(timeouts = self.timeouts_in_row, "Display unresponsive, disconnecting");
            let timeouts = self.timeouts_in_row;
            self.shutdown().await;
            return Err(Error::Unresponsive(timeouts));
        }

        match pending.kind {
            PendingKind::Write { span, .. } if pending.attempts <= self.config.write_retries => {
                debug!(start = span.start, attempt = pending.attempts, "Write timed out, resending");
                self.resend(pending).await?;
            }
            PendingKind::Write { span, .. } => {
                warn!(start = span.start, len = span.len, "Write abandoned after retries");
                self.abandon_writes(span);
            }
            PendingKind::Poll => {
                debug!("Key poll timed out");
            }
        }
        Ok(())
    }

    /// Roll back `span` and everything queued, and schedule a full redraw.
    fn abandon_writes(&mut self, span: Span) {
        if let Some(cells) = &mut self.cells {
            cells.reject(span);
            for (queued, _) in self.queue.drain(..) {
                cells.reject(queued);
            }
            cells.force_full();
        }
        self.queue.clear();
        self.dirty = true;
        self.redraw_after =
            Some(Instant::now() + Duration::from_millis(self.config.retry_cooldown_ms));
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("model", &self.model.name())
            .field("state", &self.state)
            .field("transport", &self.transport)
            .finish()
    }
}
