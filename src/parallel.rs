//! Competing chains.
//!
//! Every rank of a group proposes from the same current position, the
//! proposal with the smallest energy difference is tested against a uniform
//! draw shared by all ranks, and on acceptance the winning position is sent
//! to everyone. All ranks therefore hold identical copies of the chain.

use std::sync::mpsc::{channel, Receiver, Sender};

use faer::Mat;

use crate::chain::{accept, write_row, AcceptanceStats, Chain};
use crate::error::{HmcError, Result};
use crate::mass_matrix::KineticEnergy;
use crate::potential::PotentialEnergy;
use crate::proposal::HmcProposal;
use crate::random::{ChaChaSource, RandomSource};

/// Blocking collective operations between the ranks of a fixed size group.
///
/// Every rank has to call the same sequence of operations.
pub trait Communicator {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn barrier(&self) -> Result<()>;
    /// Returns the values of all ranks, ordered by rank.
    fn all_gather(&self, value: f64) -> Result<Vec<f64>>;
    fn broadcast_scalar(&self, root: usize, value: f64) -> Result<f64>;
    fn broadcast_position(&self, root: usize, position: &mut [f64]) -> Result<()>;
}

#[derive(Debug)]
enum Message {
    Barrier,
    Gather(f64),
    Scalar(f64),
    Position(Vec<f64>),
}

impl Message {
    fn name(&self) -> &'static str {
        match self {
            Message::Barrier => "barrier",
            Message::Gather(_) => "gather",
            Message::Scalar(_) => "scalar",
            Message::Position(_) => "position",
        }
    }
}

/// In-process communicator with one channel per ordered pair of ranks.
#[derive(Debug)]
pub struct ChannelComm {
    rank: usize,
    size: usize,
    senders: Vec<Option<Sender<Message>>>,
    receivers: Vec<Option<Receiver<Message>>>,
}

impl ChannelComm {
    /// Create the communicators of a group, indexed by rank.
    pub fn group(size: usize) -> Vec<ChannelComm> {
        assert!(size > 0, "A group needs at least one rank");

        let mut senders: Vec<Vec<Option<Sender<Message>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        let mut receivers: Vec<Vec<Option<Receiver<Message>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();

        for from in 0..size {
            for to in 0..size {
                if from == to {
                    continue;
                }
                let (tx, rx) = channel();
                senders[from][to] = Some(tx);
                receivers[to][from] = Some(rx);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| ChannelComm {
                rank,
                size,
                senders,
                receivers,
            })
            .collect()
    }

    fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).filter(move |&peer| peer != self.rank)
    }

    fn send(&self, to: usize, message: Message) -> Result<()> {
        let Some(tx) = &self.senders[to] else {
            panic!("Rank {} cannot send a message to itself", to);
        };
        tx.send(message).map_err(|_| HmcError::RankDisconnected(to))
    }

    fn recv(&self, from: usize) -> Result<Message> {
        let Some(rx) = &self.receivers[from] else {
            panic!("Rank {} cannot receive a message from itself", from);
        };
        rx.recv().map_err(|_| HmcError::RankDisconnected(from))
    }

    fn unexpected(from: usize, expected: &'static str, got: &Message) -> HmcError {
        HmcError::UnexpectedMessage {
            rank: from,
            expected,
            got: got.name(),
        }
    }
}

impl Communicator for ChannelComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<()> {
        for peer in self.peers() {
            self.send(peer, Message::Barrier)?;
        }
        for peer in self.peers() {
            match self.recv(peer)? {
                Message::Barrier => {}
                other => return Err(Self::unexpected(peer, "barrier", &other)),
            }
        }
        Ok(())
    }

    fn all_gather(&self, value: f64) -> Result<Vec<f64>> {
        for peer in self.peers() {
            self.send(peer, Message::Gather(value))?;
        }
        (0..self.size)
            .map(|peer| {
                if peer == self.rank {
                    return Ok(value);
                }
                match self.recv(peer)? {
                    Message::Gather(val) => Ok(val),
                    other => Err(Self::unexpected(peer, "gather", &other)),
                }
            })
            .collect()
    }

    fn broadcast_scalar(&self, root: usize, value: f64) -> Result<f64> {
        assert!(root < self.size, "Invalid root rank {}", root);
        if self.rank == root {
            for peer in self.peers() {
                self.send(peer, Message::Scalar(value))?;
            }
            return Ok(value);
        }
        match self.recv(root)? {
            Message::Scalar(val) => Ok(val),
            other => Err(Self::unexpected(root, "scalar", &other)),
        }
    }

    fn broadcast_position(&self, root: usize, position: &mut [f64]) -> Result<()> {
        assert!(root < self.size, "Invalid root rank {}", root);
        if self.rank == root {
            for peer in self.peers() {
                self.send(peer, Message::Position(position.to_vec()))?;
            }
            return Ok(());
        }
        match self.recv(root)? {
            Message::Position(values) => {
                assert!(
                    values.len() == position.len(),
                    "Received a position with {} elements, expected {}",
                    values.len(),
                    position.len()
                );
                position.copy_from_slice(&values);
                Ok(())
            }
            other => Err(Self::unexpected(root, "position", &other)),
        }
    }
}

/// Index of the smallest energy difference, ties go to the lowest rank.
///
/// NaN values only win if every value is NaN.
pub fn select_winner(delta_h: &[f64]) -> usize {
    assert!(!delta_h.is_empty(), "Need at least one energy difference");
    let mut winner = 0;
    for (rank, &value) in delta_h.iter().enumerate().skip(1) {
        let best = delta_h[winner];
        if value < best || (best.is_nan() && !value.is_nan()) {
            winner = rank;
        }
    }
    winner
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundOutcome {
    pub winner: usize,
    pub delta_h: f64,
    pub accepted: bool,
}

/// One rank of a group of competing HMC chains.
pub struct InterChainHmc<P, K, C, R = ChaChaSource> {
    proposal: HmcProposal<P, K>,
    comm: C,
    rng: R,
    position: Vec<f64>,
    stats: AcceptanceStats,
    rounds: Vec<RoundOutcome>,
}

impl<P, K, C, R> InterChainHmc<P, K, C, R>
where
    P: PotentialEnergy,
    K: KineticEnergy,
    C: Communicator,
    R: RandomSource,
{
    /// All ranks need to start from the same position.
    pub fn new(proposal: HmcProposal<P, K>, comm: C, start: &[f64], rng: R) -> Self {
        assert!(
            start.len() == proposal.dim(),
            "The starting point should have {} elements, got {}",
            proposal.dim(),
            start.len()
        );
        Self {
            proposal,
            comm,
            rng,
            position: start.to_vec(),
            stats: AcceptanceStats::default(),
            rounds: Vec::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn stats(&self) -> AcceptanceStats {
        self.stats
    }

    /// The rounds played during the latest call to `generate`.
    pub fn rounds(&self) -> &[RoundOutcome] {
        &self.rounds
    }

    fn round(&mut self) -> Result<bool> {
        let trajectory = self.proposal.propose(&self.position, &mut self.rng);

        self.comm.barrier()?;
        let delta_h = self.comm.all_gather(trajectory.delta_h)?;
        let winner = select_winner(&delta_h);

        let u = if self.comm.rank() == 0 {
            self.rng.uniform()
        } else {
            0.
        };
        let u = self.comm.broadcast_scalar(0, u)?;

        let accepted = accept(u, delta_h[winner]);
        self.stats.attempted += 1;
        self.rounds.push(RoundOutcome {
            winner,
            delta_h: delta_h[winner],
            accepted,
        });
        if !accepted {
            return Ok(false);
        }

        if winner == self.comm.rank() {
            self.position = trajectory.position;
        }
        self.comm.broadcast_position(winner, &mut self.position)?;
        self.stats.accepted += 1;
        Ok(true)
    }
}

impl<P, K, C, R> Chain for InterChainHmc<P, K, C, R>
where
    P: PotentialEnergy,
    K: KineticEnergy,
    C: Communicator,
    R: RandomSource,
{
    fn dim(&self) -> usize {
        self.proposal.dim()
    }

    fn position(&self) -> &[f64] {
        &self.position
    }

    fn set_position(&mut self, position: &[f64]) {
        assert!(position.len() == self.dim(), "position should have {} elements", self.dim());
        self.position.copy_from_slice(position);
    }

    fn generate(&mut self, samples: &mut Mat<f64>) -> Result<()> {
        assert!(
            samples.ncols() == self.dim(),
            "The sample buffer should have {} columns, got {}",
            self.dim(),
            samples.ncols()
        );
        self.stats = AcceptanceStats::default();
        self.rounds.clear();

        for row in 0..samples.nrows() {
            while !self.round()? {}
            write_row(samples, row, &self.position);
        }
        Ok(())
    }

    fn acceptance_rate(&self) -> f64 {
        self.stats.rate()
    }

    fn rand_state(&self) -> String {
        self.rng.serialize_state()
    }

    fn set_rand_state(&mut self, state: &str) -> Result<()> {
        self.rng.restore_state(state)
    }

    fn seed(&mut self, seed: u64) {
        self.rng.seed(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::test_util::rows;
    use crate::integrator::Leapfrog;
    use crate::mass_matrix::DiagMassMatrix;
    use crate::potential::DiagGaussPotential;
    use pretty_assertions::assert_eq;

    #[test]
    fn winner_selection() {
        assert_eq!(select_winner(&[0.3]), 0);
        assert_eq!(select_winner(&[0.3, -1., 2.]), 1);
        assert_eq!(select_winner(&[0.5, -1., -1.]), 1);
        assert_eq!(select_winner(&[f64::NAN, 4., 3.]), 2);
        assert_eq!(select_winner(&[1., f64::NAN, 0.]), 2);
        assert_eq!(select_winner(&[f64::NAN, f64::NAN]), 0);
    }

    #[test]
    fn collectives() {
        let comms = ChannelComm::group(4);
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let rank = comm.rank();
                        comm.barrier().unwrap();
                        let gathered = comm.all_gather(rank as f64 * 10.).unwrap();
                        let scalar = comm.broadcast_scalar(2, rank as f64).unwrap();
                        let mut position = vec![rank as f64; 3];
                        comm.broadcast_position(3, &mut position).unwrap();
                        comm.barrier().unwrap();
                        (gathered, scalar, position)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (gathered, scalar, position) in results {
            assert_eq!(gathered, vec![0., 10., 20., 30.]);
            assert_eq!(scalar, 2.);
            assert_eq!(position, vec![3.; 3]);
        }
    }

    #[test]
    fn single_rank_group() {
        let comm = ChannelComm::group(1).pop().unwrap();
        comm.barrier().unwrap();
        assert_eq!(comm.all_gather(1.5).unwrap(), vec![1.5]);
        assert_eq!(comm.broadcast_scalar(0, 2.5).unwrap(), 2.5);
    }

    #[test]
    fn vanished_peer() {
        let mut comms = ChannelComm::group(2);
        drop(comms.pop());
        assert!(matches!(
            comms[0].barrier(),
            Err(HmcError::RankDisconnected(1))
        ));
    }

    #[test]
    fn out_of_order_message() {
        let mut comms = ChannelComm::group(2);
        let second = comms.pop().unwrap();
        let first = comms.pop().unwrap();

        std::thread::scope(|s| {
            let handle = s.spawn(move || second.all_gather(1.));
            let err = first.broadcast_scalar(1, 0.).unwrap_err();
            assert!(matches!(
                err,
                HmcError::UnexpectedMessage {
                    rank: 1,
                    expected: "scalar",
                    got: "gather"
                }
            ));
            drop(first);
            assert!(matches!(
                handle.join().unwrap(),
                Err(HmcError::RankDisconnected(0))
            ));
        });
    }

    fn run_group(size: usize, seed: u64, num_samples: usize) -> Vec<(Vec<Vec<f64>>, Vec<RoundOutcome>, f64)> {
        let dim = 5;
        let comms = ChannelComm::group(size);
        std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let leapfrog = Leapfrog::new(
                            DiagGaussPotential::new(vec![1.; dim], vec![1., 2., 3., 4., 5.]),
                            DiagMassMatrix::identity(dim),
                        );
                        let proposal = HmcProposal::new(leapfrog, 1.1, 10);
                        let rng = ChaChaSource::with_stream(seed, comm.rank() as u64);
                        let mut chain = InterChainHmc::new(proposal, comm, &[0.; 5], rng);
                        let mut samples = Mat::zeros(num_samples, dim);
                        chain.generate(&mut samples).unwrap();
                        (rows(&samples), chain.rounds().to_vec(), chain.acceptance_rate())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn ranks_agree() {
        let results = run_group(3, 42, 30);
        let (samples, rounds, rate) = &results[0];
        assert_eq!(rounds.iter().filter(|r| r.accepted).count(), 30);
        assert!(*rate > 0. && *rate <= 1.);
        for (other_samples, other_rounds, other_rate) in &results[1..] {
            assert_eq!(other_samples, samples);
            assert_eq!(other_rounds, rounds);
            assert_eq!(other_rate, rate);
        }
        // more than one rank should win at some point
        let first_winner = rounds[0].winner;
        assert!(rounds.iter().any(|r| r.winner != first_winner));
    }

    #[test]
    fn group_is_reproducible() {
        assert_eq!(run_group(2, 7, 10), run_group(2, 7, 10));
    }
}
