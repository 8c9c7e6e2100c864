use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use faer::Mat;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{HmcError, Result};
use crate::sampler::SamplerSettings;

/// The counter a packet was credited to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketPhase {
    Burn,
    Sample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// No packet has been recorded yet.
    Fresh,
    Burning,
    Sampling,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlSection {
    num_params: usize,
    samples: u64,
    num_samples: u64,
    packet_size: usize,
    burn: u64,
    num_burn: u64,
    root: String,
    silent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainSection {
    state: String,
    acc_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RandomSection {
    state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LogDocument {
    control: ControlSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chain: Option<ChainSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    random: Option<RandomSection>,
}

/// Keeps track of burn-in and sampling progress and persists everything
/// needed to resume an interrupted run after every packet.
#[derive(Debug, Clone)]
pub struct RuntimeControl {
    settings: SamplerSettings,
    log_file: PathBuf,
    num_params: usize,
    samples_taken: u64,
    num_samples: u64,
    packet_size: usize,
    burn_taken: u64,
    num_burn: u64,
    root: String,
    silent: bool,
    chain_state: String,
    rand_state: String,
    acc_rate: f64,
    resuming: bool,
    continue_sampling: bool,
    has_header: bool,
}

impl RuntimeControl {
    /// Control for a run logging to `<root>.log`.
    pub fn new(num_params: usize, settings: &SamplerSettings) -> Self {
        let log_file = PathBuf::from(format!("{}.log", settings.root));
        Self::with_log_file(num_params, settings, log_file)
    }

    /// Control logging to an explicit file. Loads the file if it describes
    /// a resumable run.
    pub fn with_log_file(
        num_params: usize,
        settings: &SamplerSettings,
        log_file: impl Into<PathBuf>,
    ) -> Self {
        assert!(num_params > 0, "The number of parameters should be positive");
        assert!(
            settings.num_samples > 0,
            "Maximum number of samples should be a positive integer"
        );
        assert!(settings.packet_size > 0, "The packet size should be positive");

        let mut control = Self {
            settings: settings.clone(),
            log_file: log_file.into(),
            num_params,
            samples_taken: 0,
            num_samples: settings.num_samples,
            packet_size: settings.packet_size,
            burn_taken: 0,
            num_burn: settings.num_burn,
            root: settings.root.clone(),
            silent: settings.silent,
            chain_state: String::new(),
            rand_state: String::new(),
            acc_rate: 0.,
            resuming: false,
            continue_sampling: true,
            has_header: false,
        };
        control.load();
        control
    }

    fn load(&mut self) {
        let contents = match fs::read_to_string(&self.log_file) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    "No log file at {}, starting from scratch",
                    self.log_file.display()
                );
                return;
            }
            Err(err) => {
                warn!(
                    "Could not read log file {}: {}, starting from scratch",
                    self.log_file.display(),
                    err
                );
                return;
            }
        };

        match self.parse_log(&contents) {
            Ok(()) => {
                info!(
                    "Resuming from {}: {} burn-in and {} samples taken",
                    self.log_file.display(),
                    self.burn_taken,
                    self.samples_taken
                );
            }
            Err(reason) => {
                info!(
                    "Log file {} is not resumable ({}), starting from scratch",
                    self.log_file.display(),
                    reason
                );
            }
        }
    }

    fn parse_log(&mut self, contents: &str) -> std::result::Result<(), String> {
        let doc: LogDocument = serde_json::from_str(contents).map_err(|err| err.to_string())?;
        let (Some(chain), Some(random)) = (doc.chain, doc.random) else {
            return Err("no packet was recorded".to_string());
        };
        let control = doc.control;
        if control.num_params != self.num_params {
            return Err(format!(
                "expected {} parameters, found {}",
                self.num_params, control.num_params
            ));
        }
        if control.num_samples == 0 || control.packet_size == 0 {
            return Err("invalid sample counts".to_string());
        }
        parse_vector(&chain.state, self.num_params).map_err(|err| err.to_string())?;

        self.samples_taken = control.samples;
        self.num_samples = control.num_samples;
        self.packet_size = control.packet_size;
        self.burn_taken = control.burn;
        self.num_burn = control.num_burn;
        self.root = control.root;
        self.silent = control.silent;
        self.chain_state = chain.state;
        self.acc_rate = chain.acc_rate;
        self.rand_state = random.state;
        self.resuming = true;
        self.has_header = true;
        self.continue_sampling = self.samples_taken < self.num_samples;
        Ok(())
    }

    /// Forget a loaded log and start from scratch with the settings the
    /// control was created with.
    pub fn restart(&mut self) {
        *self = Self {
            settings: self.settings.clone(),
            log_file: self.log_file.clone(),
            num_params: self.num_params,
            samples_taken: 0,
            num_samples: self.settings.num_samples,
            packet_size: self.settings.packet_size,
            burn_taken: 0,
            num_burn: self.settings.num_burn,
            root: self.settings.root.clone(),
            silent: self.settings.silent,
            chain_state: String::new(),
            rand_state: String::new(),
            acc_rate: 0.,
            resuming: false,
            continue_sampling: true,
            has_header: false,
        };
    }

    /// Record a packet of samples.
    ///
    /// The whole packet is credited to the burn-in until the burn-in quota
    /// is reached, even if it overshoots it.
    pub fn save(&mut self, samples: &Mat<f64>, rand_state: &str, acc_rate: f64) -> Result<PacketPhase> {
        let rows = samples.nrows();
        assert!(rows > 0, "Cannot save an empty packet");
        assert!(
            samples.ncols() == self.num_params,
            "The packet should have {} columns, got {}",
            self.num_params,
            samples.ncols()
        );

        let phase = if self.burn_taken >= self.num_burn {
            self.samples_taken += rows as u64;
            PacketPhase::Sample
        } else {
            self.burn_taken += rows as u64;
            PacketPhase::Burn
        };
        self.continue_sampling = self.samples_taken < self.num_samples;

        let last: Vec<f64> = (0..samples.ncols())
            .map(|col| samples[(rows - 1, col)])
            .collect();
        self.chain_state = format_vector(&last);
        self.rand_state = rand_state.to_string();
        self.acc_rate = acc_rate;

        if !self.has_header {
            self.write_header()?;
        }
        self.write_document(&self.document(true))?;
        Ok(phase)
    }

    /// Write the control section of a fresh run.
    pub fn write_header(&mut self) -> Result<()> {
        self.write_document(&self.document(false))?;
        self.has_header = true;
        Ok(())
    }

    fn document(&self, with_state: bool) -> LogDocument {
        let control = ControlSection {
            num_params: self.num_params,
            samples: self.samples_taken,
            num_samples: self.num_samples,
            packet_size: self.packet_size,
            burn: self.burn_taken,
            num_burn: self.num_burn,
            root: self.root.clone(),
            silent: self.silent,
        };
        if !with_state {
            return LogDocument {
                control,
                chain: None,
                random: None,
            };
        }
        LogDocument {
            control,
            chain: Some(ChainSection {
                state: self.chain_state.clone(),
                acc_rate: self.acc_rate,
            }),
            random: Some(RandomSection {
                state: self.rand_state.clone(),
            }),
        }
    }

    fn write_document(&self, doc: &LogDocument) -> Result<()> {
        let contents = serde_json::to_string_pretty(doc)?;
        let tmp = temp_path(&self.log_file);
        fs::write(&tmp, contents).map_err(|err| HmcError::io(&tmp, err))?;
        fs::rename(&tmp, &self.log_file).map_err(|err| HmcError::io(&self.log_file, err))
    }

    pub fn phase(&self) -> RunPhase {
        if !self.continue_sampling {
            RunPhase::Done
        } else if self.burn_taken == 0 && self.samples_taken == 0 {
            RunPhase::Fresh
        } else if self.burn_taken < self.num_burn {
            RunPhase::Burning
        } else {
            RunPhase::Sampling
        }
    }

    pub fn continue_sampling(&self) -> bool {
        self.continue_sampling
    }

    pub fn resuming(&self) -> bool {
        self.resuming
    }

    pub fn has_header(&self) -> bool {
        self.has_header
    }

    pub fn num_params(&self) -> usize {
        self.num_params
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn samples_taken(&self) -> u64 {
        self.samples_taken
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    pub fn burn_taken(&self) -> u64 {
        self.burn_taken
    }

    pub fn num_burn(&self) -> u64 {
        self.num_burn
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn silent(&self) -> bool {
        self.silent
    }

    pub fn chain_state(&self) -> &str {
        &self.chain_state
    }

    pub fn rand_state(&self) -> &str {
        &self.rand_state
    }

    pub fn acc_rate(&self) -> f64 {
        self.acc_rate
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Space separated values that parse back to the identical floats.
pub fn format_vector(values: &[f64]) -> String {
    values
        .iter()
        .map(|val| val.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn parse_vector(text: &str, len: usize) -> Result<Vec<f64>> {
    let values = text
        .split_whitespace()
        .map(|val| val.parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| HmcError::InvalidChainState(text.to_string()))?;
    if values.len() != len {
        return Err(HmcError::InvalidChainState(text.to_string()));
    }
    Ok(values)
}
