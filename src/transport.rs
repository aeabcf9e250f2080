//! Generic dataplane-programming RPC contract, transport agnostic by
//! design. The wire codec is a length-delimited, serde-framed protocol:
//! a [`tokio_util::codec::LengthDelimitedCodec`] carrying `serde_json`
//! payloads, split over a duplex byte stream.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder as CodecDecoder, Encoder as CodecEncoder, FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::TransportError;
use crate::schema::{CounterSnapshot, DigestEntry, MulticastEntry, PacketOut, TableEntry};

pub struct JsonDecoder<D> {
    inner: LengthDelimitedCodec,
    _item: PhantomData<D>,
}

impl<D> Default for JsonDecoder<D> {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _item: PhantomData,
        }
    }
}

impl<D: for<'de> Deserialize<'de>> CodecDecoder for JsonDecoder<D> {
    type Item = D;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, TransportError> {
        let Some(frame) = self.inner.decode(src).map_err(TransportError::Io)? else {
            return Ok(None);
        };
        let item = serde_json::from_slice(&frame).map_err(|e| TransportError::Codec(e.to_string()))?;
        Ok(Some(item))
    }
}

pub struct JsonEncoder<E> {
    inner: LengthDelimitedCodec,
    _item: PhantomData<E>,
}

impl<E> Default for JsonEncoder<E> {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _item: PhantomData,
        }
    }
}

impl<E: Serialize> CodecEncoder<E> for JsonEncoder<E> {
    type Error = TransportError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(&item).map_err(|e| TransportError::Codec(e.to_string()))?;
        self.inner
            .encode(bytes.into(), dst)
            .map_err(TransportError::Io)
    }
}

/// `(device_id, election_id{high, low})` exchange.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ElectionId {
    pub high: u64,
    pub low: u64,
}

/// Fixed election id used by every session.
pub const FIXED_ELECTION_ID: ElectionId = ElectionId { high: 0, low: 1 };

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arbitration {
    pub device_id: u64,
    pub election_id: ElectionId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum UpdateKind {
    Insert,
    Modify,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WriteEntity {
    TableEntry(TableEntryWire),
    DigestEntry(DigestEntryWire),
    MulticastGroupEntry(MulticastEntryWire),
}

/// Wire-serializable mirror of [`TableEntry`]; the schema-typed version
/// stays internal, this is what actually crosses the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEntryWire {
    pub table_id: u32,
    pub matches: Vec<MatchWire>,
    pub action_id: Option<u32>,
    pub action_params: Vec<(u32, Vec<u8>)>,
    pub priority: Option<i32>,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MatchWire {
    Exact { field_id: u32, value: Vec<u8> },
    Lpm { field_id: u32, addr: Vec<u8>, prefix_len: u8 },
    Ternary { field_id: u32, value: Vec<u8>, mask: Vec<u8> },
    Range { field_id: u32, low: Vec<u8>, high: Vec<u8> },
}

impl From<&TableEntry> for TableEntryWire {
    fn from(e: &TableEntry) -> Self {
        let matches = e
            .matches
            .iter()
            .map(|(field_id, value)| match value {
                crate::schema::MatchValue::Exact(v) => MatchWire::Exact {
                    field_id: *field_id,
                    value: v.clone(),
                },
                crate::schema::MatchValue::Lpm { addr, prefix_len } => MatchWire::Lpm {
                    field_id: *field_id,
                    addr: addr.clone(),
                    prefix_len: *prefix_len,
                },
                crate::schema::MatchValue::Ternary { value, mask } => MatchWire::Ternary {
                    field_id: *field_id,
                    value: value.clone(),
                    mask: mask.clone(),
                },
                crate::schema::MatchValue::Range { low, high } => MatchWire::Range {
                    field_id: *field_id,
                    low: low.clone(),
                    high: high.clone(),
                },
            })
            .collect();

        TableEntryWire {
            table_id: e.table_id,
            matches,
            action_id: e.action.as_ref().map(|a| a.action_id),
            action_params: e.action.as_ref().map(|a| a.params.clone()).unwrap_or_default(),
            priority: e.priority,
            is_default: e.is_default,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestEntryWire {
    pub digest_id: u32,
    pub max_timeout_ns: u64,
    pub max_list_size: u32,
    pub ack_timeout_ns: u64,
}

impl From<&DigestEntry> for DigestEntryWire {
    fn from(d: &DigestEntry) -> Self {
        Self {
            digest_id: d.digest_id,
            max_timeout_ns: d.max_timeout_ns,
            max_list_size: d.max_list_size,
            ack_timeout_ns: d.ack_timeout_ns,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastEntryWire {
    pub group_id: u32,
    pub replicas: Vec<(u32, u32)>,
}

impl From<&MulticastEntry> for MulticastEntryWire {
    fn from(m: &MulticastEntry) -> Self {
        Self {
            group_id: m.group_id,
            replicas: m.replicas.iter().map(|r| (r.port, r.instance)).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub kind: UpdateKind,
    pub entity: WriteEntity,
}

/// Server -> client stream content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboundMessage {
    PacketIn { payload: Vec<u8>, metadata: Vec<(u32, Vec<u8>)> },
    DigestList { digest_id: u32, data: Vec<Vec<u8>> },
}

/// Client -> server stream content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutboundStreamMessage {
    PacketOut(PacketOutWire),
    DigestAck { digest_id: u32, list_id: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketOutWire {
    pub payload: Vec<u8>,
    pub metadata: Vec<(u32, Vec<u8>)>,
}

impl From<&PacketOut> for PacketOutWire {
    fn from(p: &PacketOut) -> Self {
        Self {
            payload: p.payload.clone(),
            metadata: p.metadata.clone(),
        }
    }
}

/// Generic dataplane-programming RPC, implemented once against a
/// transport-agnostic trait so a session speaks this contract regardless
/// of transport binding. The concrete I/O type is swappable behind a
/// trait object.
#[async_trait::async_trait]
pub trait DataplaneChannel: Send + Sync {
    async fn arbitrate(&mut self, req: Arbitration) -> Result<(), TransportError>;
    async fn push_pipeline(&mut self, schema_blob: Vec<u8>, device_config_blob: Vec<u8>) -> Result<(), TransportError>;
    async fn write(&mut self, updates: Vec<Update>) -> Result<(), TransportError>;
    async fn read_table_entries(&mut self, table_id: Option<u32>) -> Result<Vec<TableEntryWire>, TransportError>;
    async fn read_counter(&mut self, counter_id: u32, index: u32) -> Result<CounterSnapshot, TransportError>;
    async fn read_register(&mut self, register_id: u32, index: u32) -> Result<u64, TransportError>;
    async fn send_packet_out(&mut self, packet: PacketOutWire) -> Result<(), TransportError>;
    /// Next inbound message, or `None` on timeout. Never errors on timeout.
    async fn next_inbound(&mut self, timeout: std::time::Duration) -> Result<Option<InboundMessage>, TransportError>;
}

/// One multiplexed frame on the wire: a request/response pair correlated
/// by id, or an unsolicited server push. A single duplex socket carries
/// both the RPC and stream halves of the contract.
#[derive(Debug, Serialize, Deserialize)]
enum ChannelFrame {
    Request(u64, ChannelRequest),
    Response(u64, ChannelResponse),
    Push(InboundMessage),
}

#[derive(Debug, Serialize, Deserialize)]
enum ChannelRequest {
    Arbitrate(Arbitration),
    PushPipeline { schema_blob: Vec<u8>, device_config_blob: Vec<u8> },
    Write(Vec<Update>),
    ReadTableEntries(Option<u32>),
    ReadCounter { counter_id: u32, index: u32 },
    ReadRegister { register_id: u32, index: u32 },
    SendPacketOut(PacketOutWire),
}

#[derive(Debug, Serialize, Deserialize)]
enum ChannelResponse {
    Ok,
    TableEntries(Vec<TableEntryWire>),
    Counter(CounterSnapshot),
    Register(u64),
    Err(String),
}

/// TCP-backed [`DataplaneChannel`] over a split `FramedRead`/`FramedWrite`
/// pair. Calls into `DataplaneChannel` always go through [`SwitchSession`]'s
/// `Mutex`, so request/response correlation never races with `next_inbound`.
pub struct FramedTcpChannel {
    reader: FramedRead<ReadHalf<TcpStream>, JsonDecoder<ChannelFrame>>,
    writer: FramedWrite<WriteHalf<TcpStream>, JsonEncoder<ChannelFrame>>,
    next_request_id: u64,
    pending_pushes: VecDeque<InboundMessage>,
}

impl FramedTcpChannel {
    pub fn new(stream: TcpStream) -> Self {
        let (rx, tx) = tokio::io::split(stream);
        Self {
            reader: FramedRead::new(rx, JsonDecoder::default()),
            writer: FramedWrite::new(tx, JsonEncoder::default()),
            next_request_id: 0,
            pending_pushes: VecDeque::new(),
        }
    }

    pub async fn connect(addr: SocketAddr) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }

    async fn call(&mut self, request: ChannelRequest) -> Result<ChannelResponse, TransportError> {
        let id = self.next_request_id;
        self.next_request_id += 1;
        self.writer
            .send(ChannelFrame::Request(id, request))
            .await?;

        loop {
            let frame = self.reader.next().await.ok_or(TransportError::Closed)??;
            match frame {
                ChannelFrame::Response(rid, resp) if rid == id => return Ok(resp),
                ChannelFrame::Push(msg) => self.pending_pushes.push_back(msg),
                _ => continue,
            }
        }
    }
}

#[async_trait::async_trait]
impl DataplaneChannel for FramedTcpChannel {
    async fn arbitrate(&mut self, req: Arbitration) -> Result<(), TransportError> {
        match self.call(ChannelRequest::Arbitrate(req)).await? {
            ChannelResponse::Ok => Ok(()),
            ChannelResponse::Err(e) => Err(TransportError::Connect(e)),
            _ => Err(TransportError::Codec("unexpected response to arbitrate".into())),
        }
    }

    async fn push_pipeline(&mut self, schema_blob: Vec<u8>, device_config_blob: Vec<u8>) -> Result<(), TransportError> {
        match self
            .call(ChannelRequest::PushPipeline { schema_blob, device_config_blob })
            .await?
        {
            ChannelResponse::Ok => Ok(()),
            ChannelResponse::Err(e) => Err(TransportError::Codec(e)),
            _ => Err(TransportError::Codec("unexpected response to push_pipeline".into())),
        }
    }

    async fn write(&mut self, updates: Vec<Update>) -> Result<(), TransportError> {
        match self.call(ChannelRequest::Write(updates)).await? {
            ChannelResponse::Ok => Ok(()),
            ChannelResponse::Err(e) => Err(TransportError::Codec(e)),
            _ => Err(TransportError::Codec("unexpected response to write".into())),
        }
    }

    async fn read_table_entries(&mut self, table_id: Option<u32>) -> Result<Vec<TableEntryWire>, TransportError> {
        match self.call(ChannelRequest::ReadTableEntries(table_id)).await? {
            ChannelResponse::TableEntries(entries) => Ok(entries),
            ChannelResponse::Err(e) => Err(TransportError::Codec(e)),
            _ => Err(TransportError::Codec("unexpected response to read_table_entries".into())),
        }
    }

    async fn read_counter(&mut self, counter_id: u32, index: u32) -> Result<CounterSnapshot, TransportError> {
        match self.call(ChannelRequest::ReadCounter { counter_id, index }).await? {
            ChannelResponse::Counter(snapshot) => Ok(snapshot),
            ChannelResponse::Err(e) => Err(TransportError::Codec(e)),
            _ => Err(TransportError::Codec("unexpected response to read_counter".into())),
        }
    }

    async fn read_register(&mut self, register_id: u32, index: u32) -> Result<u64, TransportError> {
        match self.call(ChannelRequest::ReadRegister { register_id, index }).await? {
            ChannelResponse::Register(value) => Ok(value),
            ChannelResponse::Err(e) => Err(TransportError::Codec(e)),
            _ => Err(TransportError::Codec("unexpected response to read_register".into())),
        }
    }

    async fn send_packet_out(&mut self, packet: PacketOutWire) -> Result<(), TransportError> {
        match self.call(ChannelRequest::SendPacketOut(packet)).await? {
            ChannelResponse::Ok => Ok(()),
            ChannelResponse::Err(e) => Err(TransportError::Codec(e)),
            _ => Err(TransportError::Codec("unexpected response to send_packet_out".into())),
        }
    }

    async fn next_inbound(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        if let Some(msg) = self.pending_pushes.pop_front() {
            return Ok(Some(msg));
        }

        match tokio::time::timeout(timeout, self.reader.next()).await {
            Ok(Some(Ok(ChannelFrame::Push(msg)))) => Ok(Some(msg)),
            Ok(Some(Ok(_stray_response))) => Ok(None),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Err(TransportError::Closed),
            Err(_elapsed) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_round_trips_a_table_entry_frame() {
        let mut encoder = JsonEncoder::<Update>::default();
        let mut buf = BytesMut::new();
        let update = Update {
            kind: UpdateKind::Insert,
            entity: WriteEntity::TableEntry(TableEntryWire {
                table_id: 1,
                matches: vec![MatchWire::Exact {
                    field_id: 1,
                    value: vec![1, 2, 3],
                }],
                action_id: Some(2),
                action_params: vec![],
                priority: None,
                is_default: false,
            }),
        };
        encoder.encode(update, &mut buf).unwrap();

        let mut decoder = JsonDecoder::<Update>::default();
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded.kind, UpdateKind::Insert));
    }
}
