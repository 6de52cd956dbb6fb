//! Named points bound to addresses, a last-value cache, and a polling task
//! that reports changes.
//!
//! Points are registered explicitly into a [`PointTable`]; each registration
//! recomputes the contiguous address spans of the point's table so that a
//! poll reads every span with as few requests as the chunk limits allow.

use crate::{ClientError, ModbusClient};
use modlink_core::codec::bit_of;
use modlink_core::pdu::{Table, ADDRESS_SPACE};
use modlink_core::{ScalarKind, Value, WordOrder};
use modlink_datalink::DataLink;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Where a point lives and how its raw data decodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointSpec {
    pub name: String,
    pub table: Table,
    pub address: u16,
    /// Bit inside a register; register tables only.
    pub bit: Option<u8>,
    pub kind: ScalarKind,
    /// Register count of a text point.
    pub text_words: u16,
}

impl PointSpec {
    pub fn new(name: impl Into<String>, table: Table, address: u16, kind: ScalarKind) -> Self {
        Self {
            name: name.into(),
            table,
            address,
            bit: None,
            kind,
            text_words: 0,
        }
    }

    pub fn coil(name: impl Into<String>, address: u16) -> Self {
        Self::new(name, Table::Coils, address, ScalarKind::Bit)
    }

    pub fn holding(name: impl Into<String>, address: u16, kind: ScalarKind) -> Self {
        Self::new(name, Table::HoldingRegisters, address, kind)
    }

    /// Bind to one bit of a register; the kind becomes [`ScalarKind::Bit`].
    pub fn with_bit(mut self, bit: u8) -> Self {
        self.bit = Some(bit);
        self.kind = ScalarKind::Bit;
        self
    }

    pub fn with_text_words(mut self, words: u16) -> Self {
        self.text_words = words;
        self
    }

    /// Registers or bits occupied.
    pub fn width(&self) -> usize {
        if self.table.is_bit() || self.bit.is_some() {
            return 1;
        }
        match self.kind {
            ScalarKind::Text => usize::from(self.text_words),
            kind => kind.words().unwrap_or(1),
        }
    }

    fn end(&self) -> usize {
        usize::from(self.address) + self.width()
    }

    fn validate(&self) -> Result<(), ClientError> {
        if self.table.is_bit() {
            if self.kind != ScalarKind::Bit || self.bit.is_some() {
                return Err(ClientError::PointKind("bit tables only hold plain bit points"));
            }
        } else {
            match (self.kind, self.bit) {
                (ScalarKind::Bit, Some(bit)) if bit < 16 => {}
                (ScalarKind::Bit, _) => {
                    return Err(ClientError::PointKind("register bit points need a bit index 0-15"))
                }
                (_, Some(_)) => return Err(ClientError::PointKind("only bit points take a bit index")),
                (ScalarKind::Text, None) if self.text_words == 0 => {
                    return Err(ClientError::PointKind("text points need a register length"))
                }
                _ => {}
            }
        }
        if self.end() > ADDRESS_SPACE as usize {
            return Err(ClientError::Validation("point runs past address 65535"));
        }
        Ok(())
    }
}

/// A contiguous address range read in one go while polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub table: Table,
    pub address: u16,
    pub count: usize,
}

/// A point whose freshly observed value differs from the cached one.
#[derive(Debug, Clone, PartialEq)]
pub struct PointChange {
    pub name: String,
    /// `None` on the first observation.
    pub from: Option<Value>,
    pub to: Value,
}

enum Raw {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

impl Raw {
    /// Decode `point` from data that starts at address `base`.
    fn decode(&self, point: &PointSpec, base: u16, order: WordOrder) -> Result<Value, ClientError> {
        let offset = usize::from(point.address - base);
        let short = ClientError::InvalidResponse("span shorter than its points");
        match self {
            Raw::Bits(bits) => bits.get(offset).copied().map(Value::Bit).ok_or(short),
            Raw::Words(words) => {
                let slice = words.get(offset..offset + point.width()).ok_or(short)?;
                match point.bit {
                    Some(bit) => Ok(Value::Bit(bit_of(slice[0], bit))),
                    None => Ok(Value::from_words(point.kind, slice, order)?),
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct PointTable {
    points: Vec<PointSpec>,
    index: HashMap<String, usize>,
    spans: Vec<Span>,
    cache: Mutex<Vec<Option<Value>>>,
}

impl PointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: PointSpec) -> Result<(), ClientError> {
        spec.validate()?;
        if self.index.contains_key(&spec.name) {
            return Err(ClientError::Validation("point name already registered"));
        }
        let table = spec.table;
        self.index.insert(spec.name.clone(), self.points.len());
        self.points.push(spec);
        self.cache
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push(None);
        self.rebuild_spans(table);
        Ok(())
    }

    fn rebuild_spans(&mut self, table: Table) {
        let mut ranges: Vec<(usize, usize)> = self
            .points
            .iter()
            .filter(|p| p.table == table)
            .map(|p| (usize::from(p.address), p.end()))
            .collect();
        ranges.sort_unstable();

        let mut merged: Vec<(usize, usize)> = Vec::new();
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }

        self.spans.retain(|span| span.table != table);
        self.spans.extend(merged.into_iter().map(|(start, end)| Span {
            table,
            address: start as u16,
            count: end - start,
        }));
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PointSpec> {
        self.index.get(name).map(|&i| &self.points[i])
    }

    pub fn points(&self) -> impl Iterator<Item = &PointSpec> {
        self.points.iter()
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// The last successfully observed value.
    pub fn last(&self, name: &str) -> Option<Value> {
        let i = *self.index.get(name)?;
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)[i].clone()
    }

    fn lookup(&self, name: &str) -> Result<usize, ClientError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| ClientError::UnknownPoint(name.to_string()))
    }

    fn observe(&self, i: usize, value: Value) -> Option<PointChange> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache[i].as_ref() == Some(&value) {
            return None;
        }
        let from = cache[i].replace(value.clone());
        Some(PointChange {
            name: self.points[i].name.clone(),
            from,
            to: value,
        })
    }

    async fn read_raw<D: DataLink>(
        client: &ModbusClient<D>,
        table: Table,
        address: u16,
        count: usize,
    ) -> Result<Raw, ClientError> {
        if table.is_bit() {
            Ok(Raw::Bits(client.read_bits_chunked(table, address, count).await?))
        } else {
            Ok(Raw::Words(
                client.read_words_aligned(table, address, count, 1).await?,
            ))
        }
    }

    /// Read one point from the device and refresh its cached value.
    pub async fn read_point<D: DataLink>(
        &self,
        client: &ModbusClient<D>,
        name: &str,
    ) -> Result<Value, ClientError> {
        let i = self.lookup(name)?;
        let point = &self.points[i];
        let raw = Self::read_raw(client, point.table, point.address, point.width()).await?;
        let value = raw.decode(point, point.address, client.config().word_order)?;
        self.observe(i, value.clone());
        Ok(value)
    }

    /// Write one point. The cache only changes once the device accepted it.
    pub async fn write_point<D: DataLink>(
        &self,
        client: &ModbusClient<D>,
        name: &str,
        value: Value,
    ) -> Result<(), ClientError> {
        let i = self.lookup(name)?;
        let point = &self.points[i];
        if !point.table.is_writable() {
            return Err(ClientError::PointKind("point is read-only"));
        }
        if value.kind() != point.kind {
            return Err(ClientError::PointKind("value kind does not match the point"));
        }

        match (&value, point.bit) {
            (Value::Bit(bit), Some(index)) => client.write_bit(point.address, index, *bit).await?,
            (Value::Text(text), _) => {
                client
                    .write_text(point.address, text, usize::from(point.text_words))
                    .await?
            }
            _ => client.write_value(point.address, &value).await?,
        }
        self.observe(i, value);
        Ok(())
    }

    /// Read one span and return the points whose value changed.
    pub async fn poll_span<D: DataLink>(
        &self,
        client: &ModbusClient<D>,
        span: &Span,
    ) -> Result<Vec<PointChange>, ClientError> {
        let raw = Self::read_raw(client, span.table, span.address, span.count).await?;
        let order = client.config().word_order;
        let end = usize::from(span.address) + span.count;

        let mut changes = Vec::new();
        for (i, point) in self.points.iter().enumerate() {
            if point.table != span.table || point.address < span.address || point.end() > end {
                continue;
            }
            let value = raw.decode(point, span.address, order)?;
            changes.extend(self.observe(i, value));
        }
        Ok(changes)
    }

    /// Poll every span; stops at the first failing span.
    pub async fn poll_once<D: DataLink>(
        &self,
        client: &ModbusClient<D>,
    ) -> Result<Vec<PointChange>, ClientError> {
        let mut changes = Vec::new();
        for span in &self.spans {
            changes.extend(self.poll_span(client, span).await?);
        }
        Ok(changes)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    /// Poll on the interval. When off the poller only runs on
    /// [`Poller::trigger`].
    pub enabled: bool,
    /// Capacity of the change channel.
    pub channel_capacity: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(400),
            enabled: true,
            channel_capacity: 256,
        }
    }
}

impl PollConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Background task that polls a [`PointTable`] and sends each
/// [`PointChange`] down a channel. Changes of one point arrive in the order
/// they were observed.
pub struct Poller {
    trigger: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Poller {
    pub fn spawn<D: DataLink + 'static>(
        client: Arc<ModbusClient<D>>,
        table: Arc<PointTable>,
        config: PollConfig,
    ) -> (Self, mpsc::Receiver<PointChange>) {
        let (changes_tx, changes_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let trigger = Arc::new(Notify::new());
        let task = tokio::spawn(run(
            client,
            table,
            config,
            trigger.clone(),
            shutdown_rx,
            changes_tx,
        ));
        (
            Self {
                trigger,
                shutdown,
                task,
            },
            changes_rx,
        )
    }

    /// Poll now, without waiting for the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop polling and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "point poller task failed");
        }
    }
}

async fn run<D: DataLink>(
    client: Arc<ModbusClient<D>>,
    table: Arc<PointTable>,
    config: PollConfig,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    changes: mpsc::Sender<PointChange>,
) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick(), if config.enabled => {}
            _ = trigger.notified() => {}
        }

        for span in table.spans() {
            match table.poll_span(&client, span).await {
                Ok(found) => {
                    for change in found {
                        debug!(point = %change.name, value = %change.to, "point changed");
                        // A dropped receiver only loses notifications; the cache stays current.
                        let _ = changes.send(change).await;
                    }
                }
                Err(err) => warn!(
                    table = %span.table,
                    address = span.address,
                    count = span.count,
                    error = %err,
                    "point poll failed"
                ),
            }
        }
    }
}
