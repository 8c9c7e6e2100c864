//! Sample the two dimensional Rosenbrock density
//! `log π(x, y) = -[(a - x)² + b (y - x²)²]` with `a = 1, b = 100`.
//!
//! Run twice to see the second run pick up the finished log and return
//! immediately; remove `rosenbrock.log` to start over.

use anyhow::Result;
use hmc_rs::{
    ChaChaSource, ClassicHmc, DiagMassMatrix, HmcProposal, Leapfrog, PotentialEnergy, Sampler,
    SamplerSettings,
};

#[derive(Clone, Copy)]
struct Rosenbrock {
    a: f64,
    b: f64,
}

impl PotentialEnergy for Rosenbrock {
    fn dim(&self) -> usize {
        2
    }

    fn evaluate(&self, position: &[f64], gradient: &mut [f64]) -> f64 {
        let (x, y) = (position[0], position[1]);
        let curve = y - x * x;
        gradient[0] = 2. * (self.a - x) + 4. * self.b * x * curve;
        gradient[1] = -2. * self.b * curve;
        -((self.a - x).powi(2) + self.b * curve.powi(2))
    }
}

fn main() -> Result<()> {
    let settings = SamplerSettings {
        num_samples: 5000,
        num_burn: 1000,
        packet_size: 500,
        root: "rosenbrock".to_string(),
        ..Default::default()
    };

    let leapfrog = Leapfrog::new(Rosenbrock { a: 1., b: 100. }, DiagMassMatrix::identity(2));
    let proposal = HmcProposal::new(leapfrog, 0.1, 200);
    let chain = ClassicHmc::new(proposal, &[0., 0.], ChaChaSource::new(42));

    let mut sampler = Sampler::new(chain, &settings)?;
    match sampler.run()? {
        Some(progress) => println!(
            "Took {} samples after {} burn-in draws, last acceptance rate {:.3}",
            progress.samples_taken, progress.burn_taken, progress.acceptance_rate
        ),
        None => println!("Nothing left to do, samples are in rosenbrock.extract"),
    }
    Ok(())
}
