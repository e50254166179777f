//! Thin façade over single-process, in-process (threaded) or MPI
//! message passing.
//!
//! The FOF pipeline only ever talks through *blocking collectives*: every
//! rank must reach the call before any proceeds, and a collective that can
//! fail does so uniformly on all ranks. Messages are contiguous byte slices;
//! no zero-copy guarantees.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::{Arc, Barrier};

/// Blocking collective-communication interface (minimal by design).
///
/// `all_to_allv` is the only primitive an implementation must provide;
/// the reductions and the barrier have default implementations on top of
/// it. Backends with native collectives (MPI) override them.
pub trait Communicator: Send + Sync {
    /// This participant's rank id, `0..size`.
    fn rank(&self) -> usize;

    /// Number of participating ranks; fixed for the communicator lifetime.
    fn size(&self) -> usize;

    /// Exchange one byte buffer with every rank (including self).
    /// `sends[r]` goes to rank `r`; returns the buffer received from each
    /// rank, indexed by source.
    fn all_to_allv(&self, sends: &[Vec<u8>]) -> Vec<Vec<u8>>;

    /// Block until every rank has reached this call.
    fn barrier(&self) {
        let empty = vec![Vec::new(); self.size()];
        let _ = self.all_to_allv(&empty);
    }

    /// Global sum, returned on every rank.
    fn all_reduce_sum_u64(&self, value: u64) -> u64 {
        self.gather_u64(value).iter().sum()
    }

    /// Global max, returned on every rank.
    fn all_reduce_max_u64(&self, value: u64) -> u64 {
        self.gather_u64(value).into_iter().max().unwrap_or(0)
    }

    /// All-gather of one `u64` per rank, indexed by source rank.
    fn gather_u64(&self, value: u64) -> Vec<u64> {
        let payload = value.to_le_bytes().to_vec();
        let sends = vec![payload; self.size()];
        self.all_to_allv(&sends)
            .iter()
            .map(|b| bytemuck::pod_read_unaligned::<u64>(&b[..8]))
            .collect()
    }
}

/// Compile-time no-op comm for pure serial runs and unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn all_to_allv(&self, sends: &[Vec<u8>]) -> Vec<Vec<u8>> {
        sends.to_vec()
    }
    fn barrier(&self) {}
    fn all_reduce_sum_u64(&self, value: u64) -> u64 {
        value
    }
    fn all_reduce_max_u64(&self, value: u64) -> u64 {
        value
    }
}

// --- LocalComm: in-process N-rank world, one thread per rank ---

/// Shared state of one in-process world: a rendezvous barrier plus a
/// mailbox keyed by (collective epoch, src, dst).
#[derive(Debug)]
struct LocalWorld {
    size: usize,
    barrier: Barrier,
    mailbox: DashMap<(u64, usize, usize), Bytes>,
}

/// In-process communicator simulating `size` ranks without real message
/// passing; each participating thread holds one handle. Every rank must
/// issue its collectives in the same order — the epoch counter pairs the
/// matching calls.
#[derive(Debug)]
pub struct LocalComm {
    world: Arc<LocalWorld>,
    rank: usize,
    epoch: AtomicU64,
}

impl LocalComm {
    /// Create a world of `size` ranks; hand one handle to each thread.
    pub fn world(size: usize) -> Vec<LocalComm> {
        let world = Arc::new(LocalWorld {
            size,
            barrier: Barrier::new(size),
            mailbox: DashMap::new(),
        });
        (0..size)
            .map(|rank| LocalComm {
                world: world.clone(),
                rank,
                epoch: AtomicU64::new(0),
            })
            .collect()
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.world.size
    }

    fn all_to_allv(&self, sends: &[Vec<u8>]) -> Vec<Vec<u8>> {
        assert_eq!(sends.len(), self.world.size);
        let epoch = self.epoch.fetch_add(1, SeqCst);
        for (dst, buf) in sends.iter().enumerate() {
            self.world
                .mailbox
                .insert((epoch, self.rank, dst), Bytes::copy_from_slice(buf));
        }
        self.world.barrier.wait();
        let out = (0..self.world.size)
            .map(|src| {
                self.world
                    .mailbox
                    .remove(&(epoch, src, self.rank))
                    .map(|(_, v)| v.to_vec())
                    .unwrap_or_default()
            })
            .collect();
        self.world.barrier.wait();
        out
    }

    fn barrier(&self) {
        // still consumes an epoch so call sequences stay aligned
        let empty = vec![Vec::new(); self.world.size];
        let _ = self.all_to_allv(&empty);
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::Communicator;
    use mpi::collective::SystemOperation;
    use mpi::datatype::{Partition, PartitionMut};
    use mpi::environment::Universe;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// One MPI process per rank over `MPI_COMM_WORLD`.
    pub struct MpiComm {
        _universe: Universe,
        world: SimpleCommunicator,
    }

    impl MpiComm {
        /// Initialize MPI; returns `None` if it was already initialized.
        pub fn new() -> Option<Self> {
            let universe = mpi::initialize()?;
            let world = universe.world();
            Some(MpiComm {
                _universe: universe,
                world,
            })
        }
    }

    impl Communicator for MpiComm {
        fn rank(&self) -> usize {
            self.world.rank() as usize
        }

        fn size(&self) -> usize {
            self.world.size() as usize
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn all_reduce_sum_u64(&self, value: u64) -> u64 {
            let mut out = 0u64;
            self.world
                .all_reduce_into(&value, &mut out, SystemOperation::sum());
            out
        }

        fn all_reduce_max_u64(&self, value: u64) -> u64 {
            let mut out = 0u64;
            self.world
                .all_reduce_into(&value, &mut out, SystemOperation::max());
            out
        }

        fn all_to_allv(&self, sends: &[Vec<u8>]) -> Vec<Vec<u8>> {
            let n = self.size();
            let send_counts: Vec<i32> = sends.iter().map(|b| b.len() as i32).collect();
            let mut recv_counts = vec![0i32; n];
            self.world
                .all_to_all_into(&send_counts[..], &mut recv_counts[..]);

            let send_displs: Vec<i32> = send_counts
                .iter()
                .scan(0i32, |acc, &c| {
                    let d = *acc;
                    *acc += c;
                    Some(d)
                })
                .collect();
            let recv_displs: Vec<i32> = recv_counts
                .iter()
                .scan(0i32, |acc, &c| {
                    let d = *acc;
                    *acc += c;
                    Some(d)
                })
                .collect();

            let send_flat: Vec<u8> = sends.concat();
            let mut recv_flat = vec![0u8; recv_counts.iter().map(|&c| c as usize).sum()];
            {
                let send_part = Partition::new(&send_flat[..], &send_counts[..], &send_displs[..]);
                let mut recv_part =
                    PartitionMut::new(&mut recv_flat[..], &recv_counts[..], &recv_displs[..]);
                self.world
                    .all_to_all_varcount_into(&send_part, &mut recv_part);
            }

            (0..n)
                .map(|r| {
                    let off = recv_displs[r] as usize;
                    let len = recv_counts[r] as usize;
                    recv_flat[off..off + len].to_vec()
                })
                .collect()
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn no_comm_is_identity() {
        let c = NoComm;
        assert_eq!(c.size(), 1);
        assert_eq!(c.all_reduce_sum_u64(17), 17);
        let got = c.all_to_allv(&[vec![1, 2, 3]]);
        assert_eq!(got, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn local_world_all_to_allv() {
        let world = LocalComm::world(3);
        let handles: Vec<_> = world
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let r = comm.rank() as u8;
                    // rank r sends [r, dst] to each dst
                    let sends: Vec<Vec<u8>> = (0..3).map(|dst| vec![r, dst as u8]).collect();
                    let recvd = comm.all_to_allv(&sends);
                    for (src, buf) in recvd.iter().enumerate() {
                        assert_eq!(buf, &vec![src as u8, r]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn local_world_reductions() {
        let world = LocalComm::world(4);
        let handles: Vec<_> = world
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let v = comm.rank() as u64 + 1;
                    assert_eq!(comm.all_reduce_sum_u64(v), 10);
                    assert_eq!(comm.all_reduce_max_u64(v), 4);
                    assert_eq!(comm.gather_u64(v), vec![1, 2, 3, 4]);
                    comm.barrier();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
