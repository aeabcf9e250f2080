//! Per-device long-lived control channel: arbitration, pipeline install,
//! bounded inbound queue, send path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;
use crate::schema::{CounterSnapshot, DigestEntry, MulticastEntry, PacketOut, Schema, TableEntry};
use crate::transport::{
    Arbitration, DataplaneChannel, InboundMessage, PacketOutWire, TableEntryWire, Update,
    UpdateKind, WriteEntity, FIXED_ELECTION_ID,
};

/// Fixed inbound-queue capacity.
pub const INBOUND_QUEUE_CAPACITY: usize = 5;

/// Default `nextInbound` timeout.
pub const NEXT_INBOUND_TIMEOUT: Duration = Duration::from_millis(500);

/// A message tagged with its wall-clock receipt time, as pushed by the
/// stream dispatcher task.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: InboundMessage,
    pub received_at: Instant,
}

/// Bounded inbound queue receiver, owned by whichever task dispatches
/// messages for a session. Kept separate from [`SwitchSession`] so the
/// reader task (which only needs the sender) and the dispatcher task
/// (which only needs the receiver) can each own exactly what they use.
pub struct InboundQueue {
    rx: mpsc::Receiver<ReceivedMessage>,
}

impl InboundQueue {
    /// `nextInbound(timeout)`: returns the next message, or `None` on
    /// timeout — never errors.
    pub async fn next_inbound(&mut self, timeout: Duration) -> Option<ReceivedMessage> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(received) => received,
            Err(_) => None,
        }
    }
}

/// Per-device session. One active session per device id.
pub struct SwitchSession<C: DataplaneChannel> {
    pub name: String,
    pub device_id: u64,
    pub schema: Arc<Schema>,
    channel: Arc<Mutex<C>>,
    inbound_tx: mpsc::Sender<ReceivedMessage>,
}

impl<C: DataplaneChannel + 'static> SwitchSession<C> {
    pub fn new(name: String, device_id: u64, schema: Arc<Schema>, channel: C) -> (Self, InboundQueue) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        (
            Self {
                name,
                device_id,
                schema,
                channel: Arc::new(Mutex::new(channel)),
                inbound_tx,
            },
            InboundQueue { rx: inbound_rx },
        )
    }

    /// `open()`: establish transport and arbitrate mastership with the
    /// fixed election id.
    pub async fn open(&self) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        channel
            .arbitrate(Arbitration {
                device_id: self.device_id,
                election_id: FIXED_ELECTION_ID,
            })
            .await
    }

    /// `pushPipeline(schema-blob, device-config-blob)` with action
    /// VERIFY_AND_COMMIT. The codec implicitly commits; there is no
    /// separate action byte on this transport-agnostic trait.
    pub async fn push_pipeline(&self, schema_blob: Vec<u8>, device_config_blob: Vec<u8>) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        channel.push_pipeline(schema_blob, device_config_blob).await
    }

    pub async fn write_table_entry(&self, kind: UpdateKind, entry: &TableEntry) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        channel
            .write(vec![Update {
                kind,
                entity: WriteEntity::TableEntry(TableEntryWire::from(entry)),
            }])
            .await
    }

    pub async fn write_digest_entry(&self, kind: UpdateKind, entry: &DigestEntry) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        channel
            .write(vec![Update {
                kind,
                entity: WriteEntity::DigestEntry(entry.into()),
            }])
            .await
    }

    pub async fn write_multicast_entry(&self, kind: UpdateKind, entry: &MulticastEntry) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        channel
            .write(vec![Update {
                kind,
                entity: WriteEntity::MulticastGroupEntry(entry.into()),
            }])
            .await
    }

    pub async fn read_table_entries(&self, table_id: Option<u32>) -> Result<Vec<TableEntryWire>, TransportError> {
        let mut channel = self.channel.lock().await;
        channel.read_table_entries(table_id).await
    }

    pub async fn read_counters(&self, counter_id: u32, index: u32) -> Result<CounterSnapshot, TransportError> {
        let mut channel = self.channel.lock().await;
        channel.read_counter(counter_id, index).await
    }

    pub async fn read_registers(&self, register_id: u32, index: u32) -> Result<u64, TransportError> {
        let mut channel = self.channel.lock().await;
        channel.read_register(register_id, index).await
    }

    pub async fn send_packet_out(&self, packet: &PacketOut) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        channel.send_packet_out(PacketOutWire::from(packet)).await
    }

    /// Drives the stream reader: reads the next device message and pushes
    /// `(message, received_at)` onto the bounded inbound queue, blocking
    /// (applying backpressure) when the queue is full. Intended to run as
    /// its own `tokio::spawn`'d task.
    pub async fn run_reader(&self, shutdown: &mut tokio::sync::watch::Receiver<bool>) {
        loop {
            let next = {
                let mut channel = self.channel.lock().await;
                channel.next_inbound(NEXT_INBOUND_TIMEOUT).await
            };

            match next {
                Ok(Some(message)) => {
                    let received = ReceivedMessage {
                        message,
                        received_at: Instant::now(),
                    };
                    tokio::select! {
                        send = self.inbound_tx.send(received) => {
                            if send.is_err() {
                                tracing::warn!(switch = %self.name, "inbound queue closed, stopping reader");
                                return;
                            }
                        }
                        _ = shutdown.changed() => {
                            tracing::info!(switch = %self.name, "reader shutting down");
                            return;
                        }
                    }
                }
                Ok(None) => continue, // Timeout: expected, loop around.
                Err(e) => {
                    tracing::warn!(switch = %self.name, error = %e, "transport error reading stream");
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            if *shutdown.borrow() {
                return;
            }
        }
    }

}

/// An in-process, paired-channel [`DataplaneChannel`] for tests: an
/// in-memory duplex stream for exercising session logic without a real
/// socket.
pub struct InMemoryChannel {
    pub written: Vec<Update>,
    pub table_entries: Vec<TableEntryWire>,
    pub inbound: mpsc::Receiver<InboundMessage>,
    pub sent_packets: Vec<PacketOutWire>,
}

impl InMemoryChannel {
    pub fn new() -> (Self, mpsc::Sender<InboundMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                written: Vec::new(),
                table_entries: Vec::new(),
                inbound: rx,
                sent_packets: Vec::new(),
            },
            tx,
        )
    }
}

#[async_trait::async_trait]
impl DataplaneChannel for InMemoryChannel {
    async fn arbitrate(&mut self, _req: Arbitration) -> Result<(), TransportError> {
        Ok(())
    }

    async fn push_pipeline(&mut self, _schema_blob: Vec<u8>, _device_config_blob: Vec<u8>) -> Result<(), TransportError> {
        Ok(())
    }

    async fn write(&mut self, updates: Vec<Update>) -> Result<(), TransportError> {
        for update in updates {
            if let WriteEntity::TableEntry(ref entry) = update.entity {
                match update.kind {
                    UpdateKind::Insert => self.table_entries.push(entry.clone()),
                    UpdateKind::Modify => {
                        if let Some(slot) = self
                            .table_entries
                            .iter_mut()
                            .find(|e| e.table_id == entry.table_id && e.matches_eq(entry))
                        {
                            *slot = entry.clone();
                        } else {
                            self.table_entries.push(entry.clone());
                        }
                    }
                    UpdateKind::Delete => {
                        self.table_entries
                            .retain(|e| !(e.table_id == entry.table_id && e.matches_eq(entry)));
                    }
                }
            }
            self.written.push(update);
        }
        Ok(())
    }

    async fn read_table_entries(&mut self, table_id: Option<u32>) -> Result<Vec<TableEntryWire>, TransportError> {
        Ok(self
            .table_entries
            .iter()
            .filter(|e| table_id.is_none_or(|id| e.table_id == id))
            .cloned()
            .collect())
    }

    async fn read_counter(&mut self, _counter_id: u32, _index: u32) -> Result<CounterSnapshot, TransportError> {
        Ok(CounterSnapshot::default())
    }

    async fn read_register(&mut self, _register_id: u32, _index: u32) -> Result<u64, TransportError> {
        Ok(0)
    }

    async fn send_packet_out(&mut self, packet: PacketOutWire) -> Result<(), TransportError> {
        self.sent_packets.push(packet);
        Ok(())
    }

    async fn next_inbound(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => Ok(None),
            Err(_) => Ok(None),
        }
    }
}

impl TableEntryWire {
    /// Structural match-field equality used by the in-memory channel to
    /// emulate the device's own upsert semantics for tests.
    fn matches_eq(&self, other: &TableEntryWire) -> bool {
        self.matches.len() == other.matches.len()
            && self
                .matches
                .iter()
                .zip(other.matches.iter())
                .all(|(a, b)| format!("{a:?}") == format!("{b:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{NamedId, Schema, SchemaDoc};

    fn empty_schema() -> Arc<Schema> {
        Arc::new(Schema::from_doc(SchemaDoc {
            tables: vec![],
            digests: vec![NamedId { id: 1, name: "d".into() }],
            counters: vec![],
            registers: vec![],
        }))
    }

    #[tokio::test]
    async fn open_and_push_pipeline_succeed_against_in_memory_channel() {
        let (channel, _tx) = InMemoryChannel::new();
        let (session, _queue) = SwitchSession::new("s1".into(), 1, empty_schema(), channel);
        session.open().await.unwrap();
        session.push_pipeline(vec![], vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn reader_applies_backpressure_when_queue_is_full() {
        let (channel, tx) = InMemoryChannel::new();
        let (session, mut queue) = SwitchSession::new("s1".into(), 1, empty_schema(), channel);
        let (_shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        // Feed the device-side channel with more messages than the bounded
        // inbound queue (capacity 5) can hold.
        for i in 0..(INBOUND_QUEUE_CAPACITY as u8 + 3) {
            tx.send(InboundMessage::PacketIn {
                payload: vec![i],
                metadata: vec![],
            })
            .await
            .unwrap();
        }
        drop(tx);

        // Run the reader concurrently with a bounded number of drains: once
        // the queue fills, a further push blocks until we drain one — the
        // backpressure contract this queue exists to provide.
        let reader = tokio::spawn(async move {
            session.run_reader(&mut shutdown_rx).await;
        });

        let mut received = 0usize;
        while received < INBOUND_QUEUE_CAPACITY + 3 {
            match queue.next_inbound(Duration::from_secs(1)).await {
                Some(_) => received += 1,
                None => break,
            }
        }
        assert_eq!(received, INBOUND_QUEUE_CAPACITY + 3);

        reader.abort();
    }
}
