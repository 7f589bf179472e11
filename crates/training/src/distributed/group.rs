use std::{
    io::{ErrorKind, Read, Write},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    thread,
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::TrainingError;

const MSG_HELLO: u8 = 1;
const MSG_REDUCE: u8 = 2;
const MSG_BROADCAST: u8 = 3;
const HEADER_BYTES: usize = 1 + 8;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Collective operations over all training processes. Every process must
/// issue the same calls in the same order; a call returns once all peers took
/// part.
pub trait ProcessGroup: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Replace `values` with the element-wise mean over all processes.
    fn all_reduce_mean(&mut self, values: &mut [f32]) -> Result<(), TrainingError>;

    /// Replace `values` with rank 0's copy.
    fn broadcast(&mut self, values: &mut [f32]) -> Result<(), TrainingError>;
}

/// Stands in for a group of identical peers: every collective is the
/// identity. Lets a single process behave as any rank of a larger run.
#[derive(Debug, Clone, Copy)]
pub struct LoopbackGroup {
    rank: usize,
    world_size: usize,
}

impl LoopbackGroup {
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self { rank, world_size }
    }
}

impl ProcessGroup for LoopbackGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_mean(&mut self, _values: &mut [f32]) -> Result<(), TrainingError> {
        Ok(())
    }

    fn broadcast(&mut self, _values: &mut [f32]) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Star-shaped group over TCP: rank 0 accepts one connection per peer,
/// reduces in rank order and sends the result back, so every process sees
/// bit-identical values.
pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    role: Role,
}

enum Role {
    Hub { peers: Vec<TcpStream> },
    Peer { hub: TcpStream },
}

impl TcpProcessGroup {
    /// Rank 0 binds `addr`, every other rank connects to it.
    pub fn rendezvous(
        addr: &str,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self, TrainingError> {
        if rank == 0 {
            let listener = TcpListener::bind(addr).map_err(|err| {
                TrainingError::distributed(format!("failed to bind {addr}: {err}"))
            })?;
            Self::hub(listener, world_size, timeout)
        } else {
            Self::connect(addr, rank, world_size, timeout)
        }
    }

    pub fn hub(
        listener: TcpListener,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self, TrainingError> {
        if world_size < 2 {
            return Err(TrainingError::distributed(
                "a process group needs at least two processes",
            ));
        }
        listener.set_nonblocking(true)?;
        let deadline = Instant::now() + timeout;
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;

        while joined < world_size - 1 {
            match listener.accept() {
                Ok((mut stream, remote)) => {
                    stream.set_nonblocking(false)?;
                    configure(&stream, timeout)?;
                    let (kind, payload) = read_frame(&mut stream)?;
                    let rank = match (kind, payload.as_slice()) {
                        (MSG_HELLO, [rank]) => *rank as usize,
                        _ => {
                            return Err(TrainingError::distributed(format!(
                                "unexpected handshake from {remote}"
                            )))
                        }
                    };
                    if rank == 0 || rank >= world_size || slots[rank - 1].is_some() {
                        return Err(TrainingError::distributed(format!(
                            "peer {remote} announced invalid or duplicate rank {rank}"
                        )));
                    }
                    debug!(rank, %remote, "peer joined process group");
                    slots[rank - 1] = Some(stream);
                    joined += 1;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(TrainingError::distributed(format!(
                            "only {joined} of {} peers joined before the timeout",
                            world_size - 1
                        )));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(Self {
            rank: 0,
            world_size,
            role: Role::Hub {
                peers: slots.into_iter().flatten().collect(),
            },
        })
    }

    pub fn connect(
        addr: &str,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self, TrainingError> {
        if rank == 0 || rank >= world_size {
            return Err(TrainingError::distributed(format!(
                "rank {rank} cannot join a group of {world_size} as a peer"
            )));
        }
        let deadline = Instant::now() + timeout;
        let mut stream = loop {
            let attempt = addr
                .to_socket_addrs()
                .map_err(|err| TrainingError::distributed(format!("bad address {addr}: {err}")))?
                .find_map(|socket| TcpStream::connect_timeout(&socket, POLL_INTERVAL * 10).ok());
            match attempt {
                Some(stream) => break stream,
                None if Instant::now() >= deadline => {
                    return Err(TrainingError::distributed(format!(
                        "could not reach rank 0 at {addr} before the timeout"
                    )))
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };
        configure(&stream, timeout)?;
        write_frame(&mut stream, MSG_HELLO, &[rank as f32])?;

        Ok(Self {
            rank,
            world_size,
            role: Role::Peer { hub: stream },
        })
    }
}

impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_mean(&mut self, values: &mut [f32]) -> Result<(), TrainingError> {
        match &mut self.role {
            Role::Hub { peers } => {
                let mut sum: Vec<f32> = values.to_vec();
                for peer in peers.iter_mut() {
                    let contribution = expect_frame(peer, MSG_REDUCE, values.len())?;
                    for (acc, value) in sum.iter_mut().zip(contribution) {
                        *acc += value;
                    }
                }
                let scale = 1.0 / self.world_size as f32;
                for (slot, acc) in values.iter_mut().zip(sum) {
                    *slot = acc * scale;
                }
                for peer in peers.iter_mut() {
                    write_frame(peer, MSG_REDUCE, values)?;
                }
            }
            Role::Peer { hub } => {
                write_frame(hub, MSG_REDUCE, values)?;
                let reduced = expect_frame(hub, MSG_REDUCE, values.len())?;
                values.copy_from_slice(&reduced);
            }
        }
        Ok(())
    }

    fn broadcast(&mut self, values: &mut [f32]) -> Result<(), TrainingError> {
        match &mut self.role {
            Role::Hub { peers } => {
                for peer in peers.iter_mut() {
                    write_frame(peer, MSG_BROADCAST, values)?;
                }
            }
            Role::Peer { hub } => {
                let received = expect_frame(hub, MSG_BROADCAST, values.len())?;
                values.copy_from_slice(&received);
            }
        }
        Ok(())
    }
}

fn configure(stream: &TcpStream, timeout: Duration) -> Result<(), TrainingError> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(())
}

fn write_frame(stream: &mut TcpStream, kind: u8, values: &[f32]) -> Result<(), TrainingError> {
    let mut buffer = BytesMut::with_capacity(HEADER_BYTES + values.len() * 4);
    buffer.put_u8(kind);
    buffer.put_u64_le(values.len() as u64);
    for value in values {
        buffer.put_f32_le(*value);
    }
    stream
        .write_all(&buffer)
        .and_then(|_| stream.flush())
        .map_err(|err| TrainingError::distributed(format!("failed to send frame: {err}")))
}

fn read_frame(stream: &mut TcpStream) -> Result<(u8, Vec<f32>), TrainingError> {
    let mut header = [0u8; HEADER_BYTES];
    stream
        .read_exact(&mut header)
        .map_err(|err| TrainingError::distributed(format!("failed to read frame header: {err}")))?;
    let mut header = Bytes::copy_from_slice(&header);
    let kind = header.get_u8();
    let count = header.get_u64_le() as usize;

    let mut payload = vec![0u8; count * 4];
    stream
        .read_exact(&mut payload)
        .map_err(|err| TrainingError::distributed(format!("failed to read frame payload: {err}")))?;
    let mut payload = Bytes::from(payload);
    let values = (0..count).map(|_| payload.get_f32_le()).collect();
    Ok((kind, values))
}

fn expect_frame(
    stream: &mut TcpStream,
    kind: u8,
    len: usize,
) -> Result<Vec<f32>, TrainingError> {
    let (received, values) = read_frame(stream)?;
    if received != kind || values.len() != len {
        return Err(TrainingError::distributed(format!(
            "expected frame {kind} with {len} values, got frame {received} with {}",
            values.len()
        )));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (TcpProcessGroup, TcpProcessGroup) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let hub = thread::spawn(move || {
            TcpProcessGroup::hub(listener, 2, Duration::from_secs(5)).unwrap()
        });
        let peer = TcpProcessGroup::connect(&addr, 1, 2, Duration::from_secs(5)).unwrap();
        (hub.join().unwrap(), peer)
    }

    #[test]
    fn all_reduce_averages_across_processes() {
        let (mut hub, mut peer) = pair();
        let worker = thread::spawn(move || {
            let mut values = vec![3.0f32, 4.0, -1.0];
            peer.all_reduce_mean(&mut values).unwrap();
            values
        });
        let mut values = vec![1.0f32, 2.0, 1.0];
        hub.all_reduce_mean(&mut values).unwrap();
        assert_eq!(values, vec![2.0, 3.0, 0.0]);
        assert_eq!(worker.join().unwrap(), values);
    }

    #[test]
    fn broadcast_copies_rank_zero() {
        let (mut hub, mut peer) = pair();
        assert_eq!(peer.rank(), 1);
        let worker = thread::spawn(move || {
            let mut values = vec![0.0f32; 2];
            peer.broadcast(&mut values).unwrap();
            values
        });
        let mut values = vec![7.0f32, 8.0];
        hub.broadcast(&mut values).unwrap();
        assert_eq!(worker.join().unwrap(), vec![7.0, 8.0]);
    }

    #[test]
    fn hub_times_out_without_peers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let err = TcpProcessGroup::hub(listener, 2, Duration::from_millis(100))
            .err()
            .unwrap();
        assert!(matches!(err, TrainingError::Distributed(_)));
    }
}
