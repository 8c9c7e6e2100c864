//! Sample from posterior distributions using Hamiltonian Monte Carlo.
//!
//! Users provide the log density of the target and its gradient through
//! [`PotentialEnergy`]. Draws are generated in packets; after every packet the
//! progress of the run, the chain position and the random generator state
//! are written to a log, so an interrupted run picks up exactly where it
//! stopped.
//!
//! ## Usage
//!
//! ```no_run
//! use hmc_rs::{
//!     ChaChaSource, ClassicHmc, DiagMassMatrix, GaussPotential, HmcProposal, Leapfrog,
//!     Sampler, SamplerSettings,
//! };
//!
//! let dim = 10;
//! let leapfrog = Leapfrog::new(GaussPotential::standard(dim), DiagMassMatrix::identity(dim));
//! let proposal = HmcProposal::new(leapfrog, 1., 10);
//! let chain = ClassicHmc::new(proposal, &vec![0.; dim], ChaChaSource::new(42));
//!
//! let settings = SamplerSettings {
//!     num_samples: 1000,
//!     num_burn: 100,
//!     root: "./gauss".to_string(),
//!     ..Default::default()
//! };
//! let mut sampler = Sampler::new(chain, &settings)?;
//! sampler.run()?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Several chains can also compete for the same shared chain, see
//! [`sample_inter_chain`].

mod chain;
mod control;
mod csv_storage;
mod error;
mod integrator;
mod mass_matrix;
mod math;
mod parallel;
mod potential;
mod proposal;
mod random;
mod sampler;

pub use chain::{accept, AcceptanceStats, Chain, ClassicHmc};
pub use control::{format_vector, parse_vector, PacketPhase, RunPhase, RuntimeControl};
pub use csv_storage::CsvSampleWriter;
pub use error::{HmcError, Result};
pub use integrator::Leapfrog;
pub use mass_matrix::{DenseMassMatrix, DiagMassMatrix, KineticEnergy};
pub use parallel::{select_winner, ChannelComm, Communicator, InterChainHmc, RoundOutcome};
pub use potential::{DiagGaussPotential, GaussPotential, PotentialEnergy};
pub use proposal::{HmcProposal, Trajectory};
pub use random::{ChaChaSource, RandomSource};
pub use sampler::{sample_inter_chain, Progress, Sampler, SamplerSettings};
