//! Shared fixtures for the receive-path integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use homa::{
    Ack, CommonHeader, Homa, HomaConfig, HomaSocket, Packet, PacketBody, PageBufferPool,
    RecordingSink,
};

/// Local port every test socket binds.
pub const PORT: u16 = 4000;

/// Remote port the fake peer sends from.
pub const PEER_PORT: u16 = 99;

/// One protocol instance with a recording sink and a real page pool.
pub struct TestNode {
    pub homa: Arc<Homa>,
    pub sock: Arc<HomaSocket>,
    pub sink: Arc<RecordingSink>,
    pub pool: Arc<PageBufferPool>,
}

impl TestNode {
    pub fn new(config: HomaConfig) -> Self {
        Self::with_pool_pages(config, 64)
    }

    pub fn with_pool_pages(config: HomaConfig, pages: usize) -> Self {
        let sink = Arc::new(RecordingSink::new());
        let pool = Arc::new(PageBufferPool::new(pages).expect("mmap failed"));
        let homa = Arc::new(Homa::new(config, pool.clone(), sink.clone()));
        let sock = HomaSocket::new(&homa, PORT);
        Self {
            homa,
            sock,
            sink,
            pool,
        }
    }

    /// Feed one wire frame through the ingress path.
    pub fn deliver(&self, frame: (IpAddr, Vec<u8>)) {
        self.homa.deliver(&self.sock, 0, [frame]);
    }

    /// Read `len` bytes at `offset` back out of the RPC's buffer pages.
    pub fn read_buffer(&self, id: u64, mut offset: usize, len: usize) -> Vec<u8> {
        use homa::BufferPool;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let (ptr, avail) = self
                .pool
                .get_buffer(id, offset)
                .expect("no buffer at offset");
            let chunk = avail.min(len - out.len());
            // Safety: the pool keeps the pages alive and the copy stays in
            // bounds.
            out.extend_from_slice(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), chunk) });
            offset += chunk;
        }
        out
    }
}

pub fn peer_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))
}

/// Encode a frame as the peer would address it to us.
pub fn frame(sender_id: u64, body: PacketBody) -> (IpAddr, Vec<u8>) {
    let pkt = Packet {
        src: peer_addr(),
        common: CommonHeader {
            sport: PEER_PORT,
            dport: PORT,
            sender_id,
        },
        body,
    };
    (peer_addr(), pkt.encode())
}

/// A DATA frame with current cutoffs and no piggybacked ack.
pub fn data_frame(
    sender_id: u64,
    message_length: i64,
    incoming: i64,
    offset: i64,
    payload: Vec<u8>,
) -> (IpAddr, Vec<u8>) {
    frame(
        sender_id,
        PacketBody::Data {
            message_length,
            incoming,
            cutoff_version: HomaConfig::default().cutoff_version,
            retransmit: false,
            offset,
            ack: Ack::default(),
            payload,
        },
    )
}

/// Deterministic payload bytes for `len` bytes starting at `offset`.
pub fn pattern(offset: usize, len: usize) -> Vec<u8> {
    (offset..offset + len).map(|i| (i % 251) as u8).collect()
}
