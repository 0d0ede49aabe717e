//! Client for the Alfred gossip daemon.
//!
//! Alfred distributes small binary blobs across the mesh, keyed by a one byte data type tag and
//! the originating node. We talk to the local daemon over its unix socket using the v0 client
//! protocol: a publish is a single `PUSH_DATA` transaction, a query is a `REQUEST` answered by a
//! stream of `PUSH_DATA` packets carrying the latest record per peer.
//!
//! The daemon itself handles propagation over the mesh, records are best effort and eventually
//! consistent. Every operation runs under a fixed timeout, the socket is reconnected per
//! transaction the same way the reference C client does.

use core::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use bytes::{Buf, BufMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::trace;

use crate::records::DataType;

/// Default path of the Alfred unix socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/alfred.sock";

/// Per transaction timeout, dictated by the Alfred daemon.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Protocol version spoken on the unix socket.
const ALFRED_VERSION: u8 = 0;

/// Packet carrying one or more data blobs.
const PACKET_PUSH_DATA: u8 = 0;
/// Packet requesting all records for a data type.
const PACKET_REQUEST: u8 = 2;
/// Status packet closing a transaction.
const PACKET_STATUS_TXEND: u8 = 3;
/// Status packet signalling a failed transaction.
const PACKET_STATUS_ERROR: u8 = 4;

/// Size of the type/version/length header prefixing every packet and data blob.
const TLV_SIZE: usize = 4;
/// Size of the per blob header: source MAC plus a TLV.
const DATA_HEADER_SIZE: usize = 6 + TLV_SIZE;

/// A single record as stored by Alfred: the raw payload and the mesh node which published it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Hardware address of the originating node.
    pub source: [u8; 6],
    /// Raw record payload.
    pub data: Vec<u8>,
}

impl Record {
    /// The originator address in the usual colon separated form.
    pub fn source_mac(&self) -> String {
        let m = &self.source;
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// An error while talking to the Alfred daemon.
#[derive(Debug)]
pub enum AlfredError {
    /// The socket could not be reached or the transfer failed.
    Io(io::Error),
    /// The transaction did not complete within [`REQUEST_TIMEOUT`].
    Timeout,
    /// The daemon sent something we don't understand.
    Protocol(&'static str),
    /// The daemon reported a failed transaction.
    TransactionFailed,
}

impl fmt::Display for AlfredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlfredError::Io(e) => f.write_fmt(format_args!("alfred socket error: {e}")),
            AlfredError::Timeout => f.write_str("alfred transaction timed out"),
            AlfredError::Protocol(what) => {
                f.write_fmt(format_args!("alfred protocol violation: {what}"))
            }
            AlfredError::TransactionFailed => f.write_str("alfred reported a failed transaction"),
        }
    }
}

impl std::error::Error for AlfredError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AlfredError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for AlfredError {
    fn from(e: io::Error) -> Self {
        AlfredError::Io(e)
    }
}

/// The publish/request surface the workers gossip through.
///
/// Implemented by [`Client`] for production use, and by in-memory fakes in engine tests.
pub trait Gossip: Send + Sync {
    /// Publish a record under our own node identity.
    fn push(
        &self,
        kind: DataType,
        version: u8,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), AlfredError>> + Send;

    /// Fetch the latest record per peer for the given data type.
    fn fetch(&self, kind: DataType) -> impl Future<Output = Result<Vec<Record>, AlfredError>> + Send;
}

/// Alfred client talking to the local daemon over its unix socket.
#[derive(Debug, Clone)]
pub struct Client {
    socket_path: PathBuf,
}

impl Client {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Verify the daemon socket is reachable. Called once at boot, a missing socket is fatal for
    /// the whole process.
    pub async fn check(&self) -> Result<(), AlfredError> {
        run_with_timeout(async {
            UnixStream::connect(&self.socket_path).await?;
            Ok(())
        })
        .await
    }

    async fn push_inner(
        &self,
        kind: DataType,
        version: u8,
        payload: Vec<u8>,
    ) -> Result<(), AlfredError> {
        if payload.len() > u16::MAX as usize - DATA_HEADER_SIZE {
            return Err(AlfredError::Protocol("payload exceeds maximum record size"));
        }

        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let tx_id: u16 = rand::random();
        let body_len = 4 + DATA_HEADER_SIZE + payload.len();
        let mut packet = Vec::with_capacity(TLV_SIZE + body_len);
        // Outer packet TLV.
        packet.put_u8(PACKET_PUSH_DATA);
        packet.put_u8(ALFRED_VERSION);
        packet.put_u16(body_len as u16);
        packet.put_u16(tx_id);
        // Sequence number, a single packet transaction.
        packet.put_u16(0);
        // Data blob. The daemon fills in the source address of its primary interface.
        packet.put_slice(&[0u8; 6]);
        packet.put_u8(kind.tag());
        packet.put_u8(version);
        packet.put_u16(payload.len() as u16);
        packet.put_slice(&payload);

        stream.write_all(&packet).await?;
        stream.shutdown().await?;
        trace!(kind = %kind, bytes = payload.len(), "record published");

        Ok(())
    }

    async fn fetch_inner(&self, kind: DataType) -> Result<Vec<Record>, AlfredError> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let tx_id: u16 = rand::random();
        let mut request = Vec::with_capacity(TLV_SIZE + 3);
        request.put_u8(PACKET_REQUEST);
        request.put_u8(ALFRED_VERSION);
        request.put_u16(3);
        request.put_u8(kind.tag());
        request.put_u16(tx_id);
        stream.write_all(&request).await?;

        let mut records = Vec::new();
        loop {
            let mut tlv = [0u8; TLV_SIZE];
            match stream.read_exact(&mut tlv).await {
                Ok(_) => {}
                // The daemon closes the socket once the transaction is done.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let packet_type = tlv[0];
            let length = u16::from_be_bytes([tlv[2], tlv[3]]) as usize;
            let mut body = vec![0u8; length];
            stream.read_exact(&mut body).await?;

            match packet_type {
                PACKET_PUSH_DATA => parse_push_data(&body, &mut records)?,
                PACKET_STATUS_TXEND => break,
                PACKET_STATUS_ERROR => return Err(AlfredError::TransactionFailed),
                _ => return Err(AlfredError::Protocol("unexpected packet type in response")),
            }
        }

        trace!(kind = %kind, count = records.len(), "records fetched");
        Ok(records)
    }
}

impl Gossip for Client {
    async fn push(
        &self,
        kind: DataType,
        version: u8,
        payload: Vec<u8>,
    ) -> Result<(), AlfredError> {
        run_with_timeout(self.push_inner(kind, version, payload)).await
    }

    async fn fetch(&self, kind: DataType) -> Result<Vec<Record>, AlfredError> {
        run_with_timeout(self.fetch_inner(kind)).await
    }
}

async fn run_with_timeout<T>(
    fut: impl Future<Output = Result<T, AlfredError>>,
) -> Result<T, AlfredError> {
    match tokio::time::timeout(REQUEST_TIMEOUT, fut).await {
        Ok(res) => res,
        Err(_) => Err(AlfredError::Timeout),
    }
}

/// Parse the data blobs in a `PUSH_DATA` body. The body starts with the transaction id and
/// sequence number, followed by one or more source/TLV/payload blobs.
fn parse_push_data(mut body: &[u8], records: &mut Vec<Record>) -> Result<(), AlfredError> {
    if body.remaining() < 4 {
        return Err(AlfredError::Protocol("push packet too short"));
    }
    // Transaction id and sequence number, not needed to reassemble unix socket responses.
    body.advance(4);

    while body.has_remaining() {
        if body.remaining() < DATA_HEADER_SIZE {
            return Err(AlfredError::Protocol("data blob header truncated"));
        }
        let mut source = [0u8; 6];
        body.copy_to_slice(&mut source);
        // Data TLV: record tag, record version, payload length.
        body.advance(2);
        let payload_len = body.get_u16() as usize;
        if body.remaining() < payload_len {
            return Err(AlfredError::Protocol("data blob payload truncated"));
        }
        let mut data = vec![0u8; payload_len];
        body.copy_to_slice(&mut data);
        records.push(Record { source, data });
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_data_body_parses_multiple_blobs() {
        let mut body = Vec::new();
        body.put_u16(7); // tx_id
        body.put_u16(0); // seqno
        for (i, payload) in [&b"first"[..], &b"second"[..]].iter().enumerate() {
            body.put_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, i as u8]);
            body.put_u8(104);
            body.put_u8(1);
            body.put_u16(payload.len() as u16);
            body.put_slice(payload);
        }

        let mut records = Vec::new();
        parse_push_data(&body, &mut records).expect("well formed body parses");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data, b"first");
        assert_eq!(records[1].data, b"second");
        assert_eq!(records[1].source_mac(), "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn truncated_push_data_is_rejected() {
        let mut body = Vec::new();
        body.put_u16(7);
        body.put_u16(0);
        body.put_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        body.put_u8(104);
        body.put_u8(1);
        body.put_u16(32); // Claims 32 payload bytes.
        body.put_slice(b"short");

        let mut records = Vec::new();
        assert!(parse_push_data(&body, &mut records).is_err());
    }

    #[tokio::test]
    async fn fetch_reads_until_txend() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("alfred.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).expect("bind unix socket");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("client connects");
            let mut request = [0u8; 7];
            stream.read_exact(&mut request).await.expect("read request");
            assert_eq!(request[0], PACKET_REQUEST);
            assert_eq!(request[4], 104);

            // One push packet with a single blob, then txend.
            let payload = b"reservation";
            let mut response = Vec::new();
            response.put_u8(PACKET_PUSH_DATA);
            response.put_u8(ALFRED_VERSION);
            response.put_u16((4 + DATA_HEADER_SIZE + payload.len()) as u16);
            response.put_u16(1);
            response.put_u16(0);
            response.put_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
            response.put_u8(104);
            response.put_u8(1);
            response.put_u16(payload.len() as u16);
            response.put_slice(payload);

            response.put_u8(PACKET_STATUS_TXEND);
            response.put_u8(ALFRED_VERSION);
            response.put_u16(4);
            response.put_u16(1);
            response.put_u16(1);

            stream.write_all(&response).await.expect("write response");
        });

        let client = Client::new(socket_path);
        let records = client
            .fetch(DataType::AddressReservation)
            .await
            .expect("fetch succeeds");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, b"reservation");
        assert_eq!(records[0].source_mac(), "02:00:00:00:00:01");

        server.await.expect("server task");
    }

    #[tokio::test]
    async fn push_writes_a_single_transaction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("alfred.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).expect("bind unix socket");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("client connects");
            let mut packet = Vec::new();
            stream
                .read_to_end(&mut packet)
                .await
                .expect("read until shutdown");
            packet
        });

        let client = Client::new(socket_path);
        client
            .push(DataType::Gateway, 1, b"gw".to_vec())
            .await
            .expect("push succeeds");

        let packet = server.await.expect("server task");
        assert_eq!(packet[0], PACKET_PUSH_DATA);
        assert_eq!(packet[1], ALFRED_VERSION);
        // Data TLV sits after the outer TLV, tx id, seqno and zeroed source address.
        assert_eq!(packet[14], 100);
        assert_eq!(packet[15], 1);
        assert_eq!(&packet[18..], b"gw");
    }
}
