//! Socket-based fallback transport
//!
//! Rank 0 listens on the master port and every other rank connects to it.
//! Collectives are relayed through rank 0, so each worker holds exactly one
//! connection. The transport owns a current-thread tokio runtime and blocks
//! on it, which means it must not be driven from inside another tokio
//! runtime.

use super::wire::{read_frame, write_frame, Frame};
use super::{ReduceOp, Transport};
use crate::backend::{Backend, TransportFactory};
use crate::config::Rendezvous;
use crate::errors::{DdpError, Result};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tracing::{debug, info};
use uuid::Uuid;

/// Pause between attempts to reach rank 0
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on a graceful shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Factory for [`TcpTransport`]; always available.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn backend(&self) -> Backend {
        Backend::Tcp
    }

    fn probe(&self) -> Result<bool> {
        Ok(true)
    }

    fn connect(
        &self,
        rendezvous: &Rendezvous,
        rank: usize,
        world_size: usize,
    ) -> Result<Box<dyn Transport>> {
        Ok(Box::new(TcpTransport::connect(rendezvous, rank, world_size)?))
    }
}

struct Peer {
    rank: usize,
    stream: TcpStream,
}

enum Role {
    /// Rank 0, holding one connection per other rank, ordered by rank
    Master { peers: Vec<Peer> },
    /// Any other rank, connected to rank 0 only
    Worker { master: TcpStream },
}

/// Star-topology transport over TCP.
pub struct TcpTransport {
    // Declared before `runtime` so sockets are released first
    role: Option<Role>,
    runtime: Runtime,
    rank: usize,
    world_size: usize,
    group_id: Uuid,
    timeout: Duration,
    seq: u64,
}

impl TcpTransport {
    /// Rendezvous with the other ranks and return the connected endpoint.
    ///
    /// Rank 0 waits for all `world_size - 1` peers; every other rank keeps
    /// retrying the master until it answers. Both sides give up once
    /// `rendezvous.timeout` has elapsed.
    pub fn connect(rendezvous: &Rendezvous, rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(DdpError::InvalidRank { rank, world_size });
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let timeout = rendezvous.timeout;

        let (group_id, role) = if rank == 0 {
            let (group_id, peers) = block_on(
                &runtime,
                timeout,
                "rendezvous",
                accept_peers(rendezvous, world_size),
            )?;
            (group_id, Role::Master { peers })
        } else {
            let (group_id, master) = block_on(
                &runtime,
                timeout,
                "rendezvous",
                join_master(rendezvous, rank, world_size),
            )?;
            (group_id, Role::Worker { master })
        };

        info!(
            rank,
            world_size,
            group_id = %group_id,
            endpoint = %rendezvous.endpoint(),
            "Joined process group over tcp"
        );

        Ok(Self {
            role: Some(role),
            runtime,
            rank,
            world_size,
            group_id,
            timeout,
            seq: 0,
        })
    }

    fn check_src(&self, src: usize) -> Result<()> {
        if src >= self.world_size {
            return Err(DdpError::InvalidRank {
                rank: src,
                world_size: self.world_size,
            });
        }
        Ok(())
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

impl Transport for TcpTransport {
    fn backend(&self) -> Backend {
        Backend::Tcp
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn group_id(&self) -> Option<Uuid> {
        Some(self.group_id)
    }

    fn broadcast(&mut self, buffer: &mut [f32], src: usize) -> Result<()> {
        self.check_src(src)?;
        let seq = self.next_seq();
        let Self {
            role,
            runtime,
            rank,
            timeout,
            ..
        } = self;
        let role = role.as_mut().ok_or(DdpError::ProcessGroupDestroyed)?;

        block_on(
            runtime,
            *timeout,
            "broadcast",
            broadcast(role, *rank, seq, src, buffer),
        )
    }

    fn all_reduce(&mut self, buffer: &mut [f32], op: ReduceOp) -> Result<()> {
        let seq = self.next_seq();
        let Self {
            role,
            runtime,
            world_size,
            timeout,
            ..
        } = self;
        let role = role.as_mut().ok_or(DdpError::ProcessGroupDestroyed)?;

        block_on(
            runtime,
            *timeout,
            "all_reduce",
            all_reduce(role, *world_size, seq, op, buffer),
        )
    }

    fn barrier(&mut self) -> Result<()> {
        let seq = self.next_seq();
        let Self {
            role,
            runtime,
            timeout,
            ..
        } = self;
        let role = role.as_mut().ok_or(DdpError::ProcessGroupDestroyed)?;

        block_on(runtime, *timeout, "barrier", barrier(role, seq))
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(role) = self.role.take() else {
            return Ok(());
        };
        let rank = self.rank;

        block_on(
            &self.runtime,
            self.timeout.min(SHUTDOWN_TIMEOUT),
            "shutdown",
            async move {
                match role {
                    Role::Worker { mut master } => {
                        if let Err(e) = write_frame(&mut master, &Frame::Leave { rank }).await {
                            debug!(rank, error = %e, "Could not notify rank 0 of departure");
                        }
                        let _ = master.shutdown().await;
                    }
                    Role::Master { peers } => {
                        for mut peer in peers {
                            let _ = peer.stream.shutdown().await;
                        }
                    }
                }
                Ok(())
            },
        )?;

        debug!(rank, group_id = %self.group_id, "Closed tcp transport");
        Ok(())
    }
}

/// Drive `fut` to completion on `runtime`, failing after `timeout`.
fn block_on<F, T>(
    runtime: &Runtime,
    timeout: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    runtime.block_on(async {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| DdpError::Timeout { operation, timeout })?
    })
}

async fn resolve(rendezvous: &Rendezvous) -> Result<SocketAddr> {
    let endpoint = rendezvous.endpoint();
    let mut addrs = tokio::net::lookup_host(endpoint.as_str())
        .await
        .map_err(|e| DdpError::Rendezvous(format!("cannot resolve {endpoint}: {e}")))?;
    let addr = addrs
        .next()
        .ok_or_else(|| DdpError::Rendezvous(format!("{endpoint} resolved to no address")))?;
    Ok(addr)
}

async fn accept_peers(rendezvous: &Rendezvous, world_size: usize) -> Result<(Uuid, Vec<Peer>)> {
    let group_id = Uuid::new_v4();
    if world_size == 1 {
        return Ok((group_id, Vec::new()));
    }

    // Listen on every interface of the master address family
    let resolved = resolve(rendezvous).await?;
    let unspecified = match resolved.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let bind_addr = SocketAddr::new(unspecified, rendezvous.master_port);

    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| DdpError::Rendezvous(format!("cannot listen on {bind_addr}: {e}")))?;
    info!(addr = %bind_addr, world_size, "Waiting for peers");

    let mut slots: Vec<Option<TcpStream>> = (0..world_size).map(|_| None).collect();
    let mut joined = 0;

    while joined < world_size - 1 {
        let (mut stream, peer_addr) = listener.accept().await?;
        stream.set_nodelay(true)?;

        let (rank, peer_world_size) = match read_frame(&mut stream).await? {
            Frame::Hello { rank, world_size } => (rank, world_size),
            other => {
                return Err(DdpError::Protocol(format!(
                    "expected hello from {peer_addr}, got {}",
                    other.kind()
                )))
            }
        };

        let rejection = if peer_world_size != world_size {
            Some(format!(
                "rank {rank} expects world size {peer_world_size}, group has {world_size}"
            ))
        } else if rank == 0 || rank >= world_size {
            Some(format!("rank {rank} is out of range 1..{world_size}"))
        } else if slots[rank].is_some() {
            Some(format!("rank {rank} already joined"))
        } else {
            None
        };

        if let Some(reason) = rejection {
            let _ = write_frame(
                &mut stream,
                &Frame::Reject {
                    reason: reason.clone(),
                },
            )
            .await;
            return Err(DdpError::Rendezvous(reason));
        }

        debug!(rank, %peer_addr, "Peer joined");
        slots[rank] = Some(stream);
        joined += 1;
    }

    let mut peers = Vec::with_capacity(world_size - 1);
    for (rank, slot) in slots.into_iter().enumerate().skip(1) {
        let mut stream =
            slot.ok_or_else(|| DdpError::Rendezvous(format!("rank {rank} never joined")))?;
        write_frame(&mut stream, &Frame::Welcome { group_id }).await?;
        peers.push(Peer { rank, stream });
    }

    Ok((group_id, peers))
}

async fn join_master(
    rendezvous: &Rendezvous,
    rank: usize,
    world_size: usize,
) -> Result<(Uuid, TcpStream)> {
    let addr = resolve(rendezvous).await?;

    let mut attempts: u32 = 0;
    let mut stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(e) => {
                attempts += 1;
                if attempts == 1 || attempts % 50 == 0 {
                    debug!(rank, %addr, attempts, error = %e, "Master not reachable yet, retrying");
                }
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
        }
    };
    stream.set_nodelay(true)?;

    write_frame(&mut stream, &Frame::Hello { rank, world_size }).await?;

    match recv(&mut stream, 0).await? {
        Frame::Welcome { group_id } => Ok((group_id, stream)),
        Frame::Reject { reason } => Err(DdpError::Rendezvous(format!(
            "rank 0 rejected rank {rank}: {reason}"
        ))),
        other => Err(unexpected("welcome", 0, &other)),
    }
}

async fn broadcast(
    role: &mut Role,
    rank: usize,
    seq: u64,
    src: usize,
    buffer: &mut [f32],
) -> Result<()> {
    match role {
        Role::Master { peers } => {
            if src != 0 {
                let peer = &mut peers[src - 1];
                let data = expect_broadcast(&mut peer.stream, src, seq, src, buffer.len()).await?;
                buffer.copy_from_slice(&data);
            }

            let frame = Frame::Broadcast {
                seq,
                src,
                data: buffer.to_vec(),
            };
            for peer in peers.iter_mut().filter(|p| p.rank != src) {
                write_frame(&mut peer.stream, &frame).await?;
            }
        }
        Role::Worker { master } => {
            if src == rank {
                let frame = Frame::Broadcast {
                    seq,
                    src,
                    data: buffer.to_vec(),
                };
                write_frame(master, &frame).await?;
            } else {
                let data = expect_broadcast(master, 0, seq, src, buffer.len()).await?;
                buffer.copy_from_slice(&data);
            }
        }
    }

    Ok(())
}

async fn all_reduce(
    role: &mut Role,
    world_size: usize,
    seq: u64,
    op: ReduceOp,
    buffer: &mut [f32],
) -> Result<()> {
    match role {
        Role::Master { peers } => {
            let mut acc = buffer.to_vec();

            for peer in peers.iter_mut() {
                match recv(&mut peer.stream, peer.rank).await? {
                    Frame::Reduce {
                        seq: s,
                        op: o,
                        data,
                    } if s == seq && o == op => {
                        check_len(acc.len(), data.len())?;
                        for (a, v) in acc.iter_mut().zip(&data) {
                            *a += *v;
                        }
                    }
                    other => return Err(unexpected("reduce", peer.rank, &other)),
                }
            }

            if op == ReduceOp::Mean {
                let scale = 1.0 / world_size as f32;
                acc.iter_mut().for_each(|v| *v *= scale);
            }

            let frame = Frame::Reduced {
                seq,
                data: acc.clone(),
            };
            for peer in peers.iter_mut() {
                write_frame(&mut peer.stream, &frame).await?;
            }
            buffer.copy_from_slice(&acc);
        }
        Role::Worker { master } => {
            let frame = Frame::Reduce {
                seq,
                op,
                data: buffer.to_vec(),
            };
            write_frame(master, &frame).await?;

            match recv(master, 0).await? {
                Frame::Reduced { seq: s, data } if s == seq => {
                    check_len(buffer.len(), data.len())?;
                    buffer.copy_from_slice(&data);
                }
                other => return Err(unexpected("reduced", 0, &other)),
            }
        }
    }

    Ok(())
}

async fn barrier(role: &mut Role, seq: u64) -> Result<()> {
    match role {
        Role::Master { peers } => {
            for peer in peers.iter_mut() {
                match recv(&mut peer.stream, peer.rank).await? {
                    Frame::Barrier { seq: s } if s == seq => {}
                    other => return Err(unexpected("barrier", peer.rank, &other)),
                }
            }
            for peer in peers.iter_mut() {
                write_frame(&mut peer.stream, &Frame::Release { seq }).await?;
            }
        }
        Role::Worker { master } => {
            write_frame(master, &Frame::Barrier { seq }).await?;
            match recv(master, 0).await? {
                Frame::Release { seq: s } if s == seq => {}
                other => return Err(unexpected("release", 0, &other)),
            }
        }
    }

    Ok(())
}

async fn expect_broadcast(
    stream: &mut TcpStream,
    from: usize,
    seq: u64,
    src: usize,
    len: usize,
) -> Result<Vec<f32>> {
    match recv(stream, from).await? {
        Frame::Broadcast {
            seq: s,
            src: sr,
            data,
        } if s == seq && sr == src => {
            check_len(len, data.len())?;
            Ok(data)
        }
        other => Err(unexpected("broadcast", from, &other)),
    }
}

/// Read the next frame from rank `from`, turning departures into errors.
async fn recv(stream: &mut TcpStream, from: usize) -> Result<Frame> {
    match read_frame(stream).await {
        Ok(Frame::Leave { rank }) => Err(DdpError::Protocol(format!(
            "rank {rank} left the group during a collective"
        ))),
        Ok(frame) => Ok(frame),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DdpError::Network(format!(
            "rank {from} closed its connection"
        ))),
        Err(e) => Err(e.into()),
    }
}

fn unexpected(expected: &str, from: usize, frame: &Frame) -> DdpError {
    DdpError::Protocol(format!(
        "expected {expected} from rank {from}, got {}",
        frame.kind()
    ))
}

fn check_len(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(DdpError::BufferLengthMismatch { expected, got });
    }
    Ok(())
}
