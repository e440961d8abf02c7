use faer::Mat;
use rand::SeedableRng;
use rand::rngs::StdRng;

use bayesian_ifa::utils::sample_standard_normal;
use bayesian_ifa::{
    AdaptiveInit, IfaInput, IfaSampler, IfaSamplerConfig, InitialValues, ItemPriors, McmcConfig,
    ModelVariant, Restrictions, SpatialPrior, summarize_posterior,
};

fn idx_to_f64(idx: usize) -> f64 {
    f64::from(u32::try_from(idx).unwrap_or(u32::MAX))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (side, m) = (7, 6);
    let n = side * side;
    // respondents on a grid, plus three prediction sites between grid points
    let mut sites: Vec<(f64, f64)> = (0..n)
        .map(|idx| (idx_to_f64(idx % side), idx_to_f64(idx / side)))
        .collect();
    sites.extend([(0.5, 0.5), (3.5, 3.5), (5.5, 1.5)]);
    let distances = Mat::from_fn(sites.len(), sites.len(), |a, b| {
        let (xa, ya) = sites[a];
        let (xb, yb) = sites[b];
        (xa - xb).hypot(ya - yb)
    });

    let mut rng = StdRng::seed_from_u64(7);
    // smooth trait surface plus noise
    let theta: Vec<f64> = sites
        .iter()
        .take(n)
        .map(|(x, y)| (0.6 * x).sin() + (0.4 * y).cos() - 0.5 + 0.3 * sample_standard_normal(&mut rng))
        .collect();
    let responses = Mat::from_fn(n, m, |i, j| {
        let z = 1.2f64.mul_add(theta[i], sample_standard_normal(&mut rng)) - 0.2 * idx_to_f64(j % 3);
        if z > 0.0 { 1.0 } else { 0.0 }
    });

    let input = IfaInput::new(responses, 1).with_distances(distances);
    let mut sampler = IfaSampler::new(
        &input,
        &Restrictions::unrestricted(m, 1),
        InitialValues::standard(n, m, 1, 0.5).with_spatial(vec![0.5], vec![2.0]),
        &AdaptiveInit::default(),
        ModelVariant::SpatialPredictive,
    )?;

    let config = IfaSamplerConfig {
        mcmc: McmcConfig {
            iterations: 1_500,
            burn_in: 500,
            thin: 5,
            seed: 11,
        },
        spatial_prior: SpatialPrior {
            range_shape: 2.0,
            range_rate: 0.5,
        },
        ..IfaSamplerConfig::default()
    };
    let priors = ItemPriors::broadcast(m, 1, (0.0, 2.0), (0.0, 2.0));
    let samples = sampler.sample(&priors, config)?;

    let shares = samples.trace(|draw| draw.spatial_share.as_ref().map_or(f64::NAN, |s| s[0]));
    let ranges = samples.trace(|draw| draw.spatial_range.as_ref().map_or(f64::NAN, |r| r[0]));
    let mean = |values: &[f64]| values.iter().sum::<f64>() / idx_to_f64(values.len().max(1));
    println!(
        "retained draws={}, spatial share mean={:.3}, range mean={:.3}",
        samples.len(),
        mean(&shares),
        mean(&ranges)
    );
    for block in &samples.diagnostics.blocks {
        println!("{:?} block acceptance={:.3}", block.block, block.acceptance_rate);
    }

    let summary = summarize_posterior(&samples);
    if let Some(predicted) = summary.predicted_theta_mean {
        for (point, (x, y)) in sites.iter().skip(n).enumerate() {
            println!("site ({x:.1}, {y:.1}): predicted trait mean={:.3}", predicted[(point, 0)]);
        }
    }
    Ok(())
}
