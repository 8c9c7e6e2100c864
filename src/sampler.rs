use std::path::PathBuf;
use std::sync::mpsc::channel;

use anyhow::{bail, Context, Result};
use faer::Mat;
use log::{debug, info, warn};
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};

use crate::chain::Chain;
use crate::control::{parse_vector, PacketPhase, RunPhase, RuntimeControl};
use crate::csv_storage::CsvSampleWriter;
use crate::error::HmcError;
use crate::mass_matrix::KineticEnergy;
use crate::parallel::{ChannelComm, Communicator, InterChainHmc};
use crate::potential::PotentialEnergy;
use crate::proposal::HmcProposal;
use crate::random::ChaChaSource;

/// Settings of a sampling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    /// Number of samples to keep after the burn-in.
    pub num_samples: u64,
    /// Number of draws to discard before keeping samples.
    pub num_burn: u64,
    /// Number of draws generated and persisted as one unit.
    pub packet_size: usize,
    /// Prefix of the log and sample files.
    pub root: String,
    /// Only report progress at debug level.
    pub silent: bool,
    /// Also write the burn-in draws to the sample file.
    pub store_burn: bool,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            num_samples: 1000,
            num_burn: 100,
            packet_size: 100,
            root: "./chain".to_string(),
            silent: false,
            store_burn: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Packets generated by this sampler since it was created.
    pub packet: u64,
    pub phase: PacketPhase,
    pub burn_taken: u64,
    pub samples_taken: u64,
    pub acceptance_rate: f64,
}

/// Drives a chain packet by packet, persisting the run after each packet.
pub struct Sampler<C: Chain> {
    chain: C,
    control: RuntimeControl,
    writer: CsvSampleWriter,
    samples: Mat<f64>,
    store_burn: bool,
    packet: u64,
}

impl<C: Chain> Sampler<C> {
    /// Create a sampler logging to `<root>.log` and writing samples to
    /// `<root>.extract`. A previous run with the same root is resumed.
    pub fn new(chain: C, settings: &SamplerSettings) -> Result<Self> {
        let control = RuntimeControl::new(chain.dim(), settings);
        let extract = PathBuf::from(format!("{}.extract", settings.root));
        Self::from_parts(chain, control, extract, settings.store_burn)
    }

    fn from_parts(
        mut chain: C,
        mut control: RuntimeControl,
        extract: PathBuf,
        store_burn: bool,
    ) -> Result<Self> {
        if control.resuming() {
            if let Err(err) = restore_chain(&mut chain, &control) {
                warn!(
                    "Could not restore the chain from {}: {}, starting from scratch",
                    control.log_file().display(),
                    err
                );
                control.restart();
            }
        }
        if !control.resuming() {
            control
                .write_header()
                .with_context(|| format!("Could not write {}", control.log_file().display()))?;
        }

        let writer = CsvSampleWriter::open(&extract, control.resuming())
            .context("Could not open the sample file")?;
        let samples = Mat::zeros(control.packet_size(), chain.dim());

        Ok(Self {
            chain,
            control,
            writer,
            samples,
            store_burn,
            packet: 0,
        })
    }

    /// Generate, record and write one packet.
    pub fn step(&mut self) -> Result<Progress> {
        self.chain
            .generate(&mut self.samples)
            .context("Failed to generate a packet of samples")?;

        let acceptance_rate = self.chain.acceptance_rate();
        let phase = self
            .control
            .save(&self.samples, &self.chain.rand_state(), acceptance_rate)
            .context("Could not save the runtime log")?;

        if phase == PacketPhase::Sample || self.store_burn {
            self.writer
                .write(&self.samples)
                .context("Could not write samples")?;
        }
        self.packet += 1;

        let progress = Progress {
            packet: self.packet,
            phase,
            burn_taken: self.control.burn_taken(),
            samples_taken: self.control.samples_taken(),
            acceptance_rate,
        };
        if self.control.silent() {
            debug!("{:?}", progress);
        } else {
            info!(
                "Packet {} ({:?}): burn {}/{}, samples {}/{}, acceptance rate {:.3}",
                progress.packet,
                phase,
                progress.burn_taken,
                self.control.num_burn(),
                progress.samples_taken,
                self.control.num_samples(),
                acceptance_rate
            );
        }
        Ok(progress)
    }

    /// Step until the required number of samples is reached.
    ///
    /// Returns the progress after the last packet, or `None` if the run was
    /// already finished.
    pub fn run(&mut self) -> Result<Option<Progress>> {
        let mut last = None;
        while self.control.continue_sampling() {
            last = Some(self.step()?);
        }
        info!(
            "Finished sampling, {} samples written to {}",
            self.control.samples_taken(),
            self.writer.path().display()
        );
        Ok(last)
    }

    pub fn continue_sampling(&self) -> bool {
        self.control.continue_sampling()
    }

    pub fn phase(&self) -> RunPhase {
        self.control.phase()
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn control(&self) -> &RuntimeControl {
        &self.control
    }

    pub fn into_chain(self) -> C {
        self.chain
    }
}

fn restore_chain<C: Chain>(chain: &mut C, control: &RuntimeControl) -> crate::error::Result<()> {
    let position = parse_vector(control.chain_state(), chain.dim())?;
    chain.set_rand_state(control.rand_state())?;
    chain.set_position(&position);
    Ok(())
}

/// Run a group of `num_chains` competing chains, one thread per rank.
///
/// Rank `r` draws from stream `r` of `seed`, logs to `<root>.log.<r>` and
/// writes its copy of the samples to `<root>.extract.<r>`. Returns the last
/// progress of every rank, `None` for ranks that had nothing left to do.
pub fn sample_inter_chain<P, K, F>(
    settings: &SamplerSettings,
    num_chains: usize,
    seed: u64,
    start: &[f64],
    make_proposal: F,
) -> Result<Vec<Option<Progress>>>
where
    P: PotentialEnergy,
    K: KineticEnergy,
    F: Fn(usize) -> HmcProposal<P, K> + Sync,
{
    if num_chains == 0 {
        bail!("At least one chain is required");
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(num_chains + 1)
        .thread_name(|i| format!("hmc-rank-{}", i))
        .build()
        .context("Could not start thread pool")?;

    let (results_tx, results_rx) = channel();
    let make_proposal = &make_proposal;

    pool.scope_fifo(|scope| {
        for comm in ChannelComm::group(num_chains) {
            let results = results_tx.clone();
            scope.spawn_fifo(move |_| {
                let rank = comm.rank();
                let result = run_rank(settings, seed, start, make_proposal(rank), comm);
                let _ = results.send((rank, result));
            });
        }
    });
    drop(results_tx);

    let mut results: Vec<_> = results_rx.into_iter().collect();
    results.sort_by_key(|(rank, _)| *rank);
    if results.len() != num_chains {
        bail!("Only {} of {} chains reported back", results.len(), num_chains);
    }

    // Report the rank that failed first rather than the ranks that lost it
    let is_disconnect = |err: &anyhow::Error| {
        matches!(
            err.downcast_ref::<HmcError>(),
            Some(HmcError::RankDisconnected(_))
        )
    };
    let mut errors: Vec<_> = results
        .iter()
        .filter_map(|(rank, result)| result.as_ref().err().map(|err| (*rank, err)))
        .collect();
    errors.sort_by_key(|(_, err)| is_disconnect(*err));
    if let Some((rank, err)) = errors.first() {
        bail!("Chain {} failed: {:#}", rank, err);
    }

    results
        .into_iter()
        .map(|(_, result)| result)
        .collect()
}

fn run_rank<P, K>(
    settings: &SamplerSettings,
    seed: u64,
    start: &[f64],
    proposal: HmcProposal<P, K>,
    comm: ChannelComm,
) -> Result<Option<Progress>>
where
    P: PotentialEnergy,
    K: KineticEnergy,
{
    let rank = comm.rank();
    let rng = ChaChaSource::with_stream(seed, rank as u64);
    let chain = InterChainHmc::new(proposal, comm, start, rng);

    let control = RuntimeControl::with_log_file(
        chain.dim(),
        settings,
        format!("{}.log.{}", settings.root, rank),
    );
    let extract = PathBuf::from(format!("{}.extract.{}", settings.root, rank));
    let mut sampler = Sampler::from_parts(chain, control, extract, settings.store_burn)
        .with_context(|| format!("Could not set up chain {}", rank))?;

    let resuming = sampler.control().resuming();
    let flags: Vec<bool> = sampler
        .chain()
        .comm()
        .all_gather(if resuming { 1. } else { 0. })?
        .into_iter()
        .map(|flag| flag > 0.5)
        .collect();
    if rank == 0 {
        for (other, resumes) in flags.iter().enumerate() {
            if *resumes {
                info!("Rank {} resumes from its log", other);
            } else {
                info!("Rank {} starts from scratch", other);
            }
        }
    }
    if flags.iter().any(|&flag| flag != resuming) {
        return Err(HmcError::InconsistentResume(flags).into());
    }
    if resuming {
        check_resumed_packets(&sampler)?;
    }

    sampler.run()
}

/// Every rank has to resume from the same packet and the same position.
fn check_resumed_packets<P, K>(
    sampler: &Sampler<InterChainHmc<P, K, ChannelComm>>,
) -> crate::error::Result<()>
where
    P: PotentialEnergy,
    K: KineticEnergy,
{
    let comm = sampler.chain().comm();
    let burn = comm.all_gather(sampler.control().burn_taken() as f64)?;
    let samples = comm.all_gather(sampler.control().samples_taken() as f64)?;
    if burn.iter().any(|&val| val != burn[0]) || samples.iter().any(|&val| val != samples[0]) {
        return Err(HmcError::MismatchedResume {
            burn: burn.iter().map(|&val| val as u64).collect(),
            samples: samples.iter().map(|&val| val as u64).collect(),
        });
    }

    let mut position = sampler.chain().position().to_vec();
    comm.broadcast_position(0, &mut position)?;
    if position.as_slice() != sampler.chain().position() {
        return Err(HmcError::DivergedPosition(comm.rank()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ClassicHmc;
    use crate::integrator::Leapfrog;
    use crate::mass_matrix::DiagMassMatrix;
    use crate::potential::GaussPotential;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::Path;

    fn settings(dir: &Path, name: &str) -> SamplerSettings {
        SamplerSettings {
            num_samples: 40,
            num_burn: 20,
            packet_size: 10,
            root: dir.join(name).to_string_lossy().into_owned(),
            silent: true,
            store_burn: false,
        }
    }

    fn chain(seed: u64) -> ClassicHmc<GaussPotential, DiagMassMatrix> {
        let leapfrog = Leapfrog::new(GaussPotential::standard(3), DiagMassMatrix::identity(3));
        ClassicHmc::new(HmcProposal::new(leapfrog, 1., 10), &[0.5, 0., -0.5], ChaChaSource::new(seed))
    }

    fn proposal(_rank: usize) -> HmcProposal<GaussPotential, DiagMassMatrix> {
        let leapfrog = Leapfrog::new(GaussPotential::standard(3), DiagMassMatrix::identity(3));
        HmcProposal::new(leapfrog, 1., 10)
    }

    #[test]
    fn settings_from_json() {
        let settings: SamplerSettings =
            serde_json::from_str(r#"{"num_samples": 10, "root": "out/run"}"#).unwrap();
        assert_eq!(settings.num_samples, 10);
        assert_eq!(settings.root, "out/run");
        assert_eq!(settings.packet_size, SamplerSettings::default().packet_size);
    }

    #[test]
    fn full_run() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), "full");
        let mut sampler = Sampler::new(chain(1), &settings).unwrap();
        assert_eq!(sampler.phase(), RunPhase::Fresh);

        let progress = sampler.run().unwrap().unwrap();
        assert_eq!(progress.packet, 6);
        assert_eq!(progress.burn_taken, 20);
        assert_eq!(progress.samples_taken, 40);
        assert_eq!(progress.phase, PacketPhase::Sample);
        assert_eq!(sampler.phase(), RunPhase::Done);

        let contents = fs::read_to_string(dir.path().join("full.extract")).unwrap();
        assert_eq!(contents.lines().count(), 40);
        assert!(contents.lines().all(|line| line.split(',').count() == 3));

        // a finished run has nothing left to do
        let mut again = Sampler::new(chain(1), &settings).unwrap();
        assert!(again.control().resuming());
        assert_eq!(again.run().unwrap(), None);
        let after = fs::read_to_string(dir.path().join("full.extract")).unwrap();
        assert_eq!(after, contents);
    }

    #[test]
    fn store_burn_writes_every_packet() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), "burn");
        settings.store_burn = true;
        Sampler::new(chain(1), &settings).unwrap().run().unwrap();
        let contents = fs::read_to_string(dir.path().join("burn.extract")).unwrap();
        assert_eq!(contents.lines().count(), 60);
    }

    #[test]
    fn resume_matches_uninterrupted_run() {
        let dir = tempfile::tempdir().unwrap();

        let reference = settings(dir.path(), "reference");
        Sampler::new(chain(77), &reference).unwrap().run().unwrap();

        let interrupted = settings(dir.path(), "interrupted");
        {
            let mut sampler = Sampler::new(chain(77), &interrupted).unwrap();
            // both burn-in packets and one sample packet
            for _ in 0..3 {
                sampler.step().unwrap();
            }
        }
        // a different seed and start, both are overwritten by the log
        let mut sampler = Sampler::new(chain(5), &interrupted).unwrap();
        assert!(sampler.control().resuming());
        assert_eq!(sampler.phase(), RunPhase::Sampling);
        let progress = sampler.run().unwrap().unwrap();
        assert_eq!(progress.packet, 3);
        assert_eq!(progress.samples_taken, 40);

        let expected = fs::read_to_string(dir.path().join("reference.extract")).unwrap();
        let resumed = fs::read_to_string(dir.path().join("interrupted.extract")).unwrap();
        assert_eq!(resumed, expected);
    }

    #[test]
    fn corrupt_random_state_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), "corrupt");
        {
            let mut sampler = Sampler::new(chain(3), &settings).unwrap();
            sampler.step().unwrap();
        }
        let log = dir.path().join("corrupt.log");
        let contents = fs::read_to_string(&log).unwrap();
        let mut doc: serde_json::Value = serde_json::from_str(&contents).unwrap();
        doc["random"]["state"] = serde_json::Value::String("not a state".to_string());
        fs::write(&log, doc.to_string()).unwrap();

        let sampler = Sampler::new(chain(3), &settings).unwrap();
        assert!(!sampler.control().resuming());
        assert_eq!(sampler.phase(), RunPhase::Fresh);
        assert_eq!(sampler.chain().position(), &[0.5, 0., -0.5]);
    }

    #[test]
    fn restore_uses_logged_state() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), "restore");
        let (position, state) = {
            let mut sampler = Sampler::new(chain(9), &settings).unwrap();
            sampler.step().unwrap();
            let chain = sampler.into_chain();
            (chain.position().to_vec(), chain.rand_state())
        };
        let sampler = Sampler::new(chain(1), &settings).unwrap();
        assert_eq!(sampler.chain().position(), position.as_slice());
        assert_eq!(sampler.chain().rand_state(), state);
    }

    #[test]
    fn inter_chain_ranks_write_identical_samples() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), "group");
        let progress = sample_inter_chain(&settings, 3, 11, &[0.5, 0., -0.5], proposal).unwrap();
        assert_eq!(progress.len(), 3);
        for rank_progress in &progress {
            let rank_progress = rank_progress.unwrap();
            assert_eq!(rank_progress.samples_taken, 40);
            assert_eq!(rank_progress.acceptance_rate, progress[0].unwrap().acceptance_rate);
        }

        let first = fs::read_to_string(dir.path().join("group.extract.0")).unwrap();
        assert_eq!(first.lines().count(), 40);
        for rank in 1..3 {
            let other = fs::read_to_string(dir.path().join(format!("group.extract.{}", rank))).unwrap();
            assert_eq!(other, first);
        }
        assert!(dir.path().join("group.log.2").exists());
    }

    #[test]
    fn inter_chain_resume_matches_uninterrupted_run() {
        let dir = tempfile::tempdir().unwrap();
        let reference = settings(dir.path(), "reference");
        sample_inter_chain(&reference, 2, 4, &[0.5, 0., -0.5], proposal).unwrap();

        let mut interrupted = settings(dir.path(), "interrupted");
        interrupted.num_samples = 20;
        sample_inter_chain(&interrupted, 2, 4, &[0.5, 0., -0.5], proposal).unwrap();

        // the logged quota wins, so raise it in the logs before resuming
        for rank in 0..2 {
            let log = dir.path().join(format!("interrupted.log.{}", rank));
            let mut doc: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&log).unwrap()).unwrap();
            doc["control"]["numSamples"] = serde_json::json!(40);
            fs::write(&log, doc.to_string()).unwrap();
        }
        let progress = sample_inter_chain(&interrupted, 2, 4, &[0.5, 0., -0.5], proposal).unwrap();
        assert_eq!(progress[0].unwrap().samples_taken, 40);

        for rank in 0..2 {
            let expected =
                fs::read_to_string(dir.path().join(format!("reference.extract.{}", rank))).unwrap();
            let resumed =
                fs::read_to_string(dir.path().join(format!("interrupted.extract.{}", rank))).unwrap();
            assert_eq!(resumed, expected);
        }
    }

    fn set_num_samples(log: &Path, num_samples: u64) {
        let mut doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(log).unwrap()).unwrap();
        doc["control"]["numSamples"] = serde_json::json!(num_samples);
        fs::write(log, doc.to_string()).unwrap();
    }

    #[test]
    fn stale_rank_log_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), "stale");
        settings.num_samples = 10;
        let start = [0.5, 0., -0.5];
        sample_inter_chain(&settings, 2, 4, &start, proposal).unwrap();

        // rank 1 was killed before saving the next packet
        let log_1 = dir.path().join("stale.log.1");
        let stale = fs::read_to_string(&log_1).unwrap();
        for rank in 0..2 {
            set_num_samples(&dir.path().join(format!("stale.log.{}", rank)), 20);
        }
        sample_inter_chain(&settings, 2, 4, &start, proposal).unwrap();
        fs::write(&log_1, stale).unwrap();

        for rank in 0..2 {
            set_num_samples(&dir.path().join(format!("stale.log.{}", rank)), 40);
        }
        let err = sample_inter_chain(&settings, 2, 4, &start, proposal).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("different packets"), "{}", message);
        assert!(message.contains("samples [20, 10]"), "{}", message);

        // nothing was sampled from the mismatched state
        for rank in 0..2 {
            let extract = fs::read_to_string(dir.path().join(format!("stale.extract.{}", rank))).unwrap();
            assert_eq!(extract.lines().count(), 20);
        }
        let control = RuntimeControl::with_log_file(3, &settings, log_1.clone());
        assert_eq!(control.samples_taken(), 10);
    }

    #[test]
    fn resumed_ranks_agree_on_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), "moved");
        settings.num_samples = 10;
        let start = [0.5, 0., -0.5];
        sample_inter_chain(&settings, 2, 4, &start, proposal).unwrap();

        let log_1 = dir.path().join("moved.log.1");
        let mut doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&log_1).unwrap()).unwrap();
        doc["chain"]["state"] = serde_json::json!("1 2 3");
        doc["control"]["numSamples"] = serde_json::json!(20);
        fs::write(&log_1, doc.to_string()).unwrap();
        set_num_samples(&dir.path().join("moved.log.0"), 20);

        let err = sample_inter_chain(&settings, 2, 4, &start, proposal).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("Chain 1 failed"), "{}", message);
        assert!(message.contains("different position"), "{}", message);
    }

    #[test]
    fn inconsistent_resume_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), "mixed");
        sample_inter_chain(&settings, 2, 4, &[0.5, 0., -0.5], proposal).unwrap();
        fs::remove_file(dir.path().join("mixed.log.1")).unwrap();

        let err = sample_inter_chain(&settings, 2, 4, &[0.5, 0., -0.5], proposal).unwrap_err();
        assert!(format!("{:#}", err).contains("Only some ranks"), "{:#}", err);
    }
}
