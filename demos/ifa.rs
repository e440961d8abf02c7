use faer::Mat;
use rand::SeedableRng;
use rand::rngs::StdRng;

use bayesian_ifa::utils::sample_standard_normal;
use bayesian_ifa::{
    AdaptiveInit, IfaInput, IfaSampler, IfaSamplerConfig, InitialValues, ItemPriors, McmcConfig,
    ModelVariant, Restrictions, effective_sample_size, response_diagnostics, summarize_posterior,
};

fn idx_to_f64(idx: usize) -> f64 {
    f64::from(u32::try_from(idx).unwrap_or(u32::MAX))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (n, m, q) = (200, 8, 2);
    // items 0-3 load on factor 0, items 4-7 on factor 1
    let pattern = Mat::from_fn(m, q, |j, k| if j / 4 == k { 1.0 } else { 0.0 });
    let responses = simulate_ordinal(n, &pattern, 0.4, 2_026);

    for summary in response_diagnostics(&responses) {
        println!(
            "item {}: observed={}, missing={}, category counts={:?}",
            summary.item, summary.n_observed, summary.n_missing, summary.category_counts
        );
    }

    let input = IfaInput::new(responses, q);
    let mut sampler = IfaSampler::new(
        &input,
        &Restrictions::new(pattern),
        InitialValues::standard(n, m, q, 0.5),
        &AdaptiveInit::default(),
        ModelVariant::Exploratory,
    )?;

    let config = IfaSamplerConfig {
        mcmc: McmcConfig {
            iterations: 3_000,
            burn_in: 1_000,
            thin: 5,
            seed: 2_026,
        },
        ..IfaSamplerConfig::default()
    };
    let priors = ItemPriors::broadcast(m, q, (0.0, 2.0), (0.0, 2.0));
    let samples = sampler.sample(&priors, config)?;
    println!(
        "Sampler: iterations={}, retained draws={}, truncation fallbacks={}",
        samples.diagnostics.iterations_completed,
        samples.len(),
        samples.diagnostics.truncation_fallbacks
    );
    for block in &samples.diagnostics.blocks {
        println!(
            "{:?} block: acceptance={:.3}, logscale={:.3}",
            block.block, block.acceptance_rate, block.logscale
        );
    }

    let summary = summarize_posterior(&samples);
    for (item, difficulty) in summary.difficulty.iter().enumerate() {
        let loading = summary.discrimination[item * q + item / 4];
        println!(
            "item {item}: c mean={:.3} [{:.3}, {:.3}], loading mean={:.3} [{:.3}, {:.3}]",
            difficulty.mean,
            difficulty.q025,
            difficulty.q975,
            loading.mean,
            loading.q025,
            loading.q975
        );
    }
    if let Some(corr) = summary.correlation.first() {
        println!(
            "trait correlation mean={:.3}, 95% CrI [{:.3}, {:.3}], ESS={:.1}",
            corr.mean,
            corr.q025,
            corr.q975,
            effective_sample_size(&samples.trace(|draw| draw.correlation[(1, 0)]))
        );
    }
    Ok(())
}

/// Four-category probit responses with traits correlated at `rho`.
fn simulate_ordinal(n: usize, pattern: &Mat<f64>, rho: f64, seed: u64) -> Mat<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let theta = Mat::from_fn(n, 2, |_, _| sample_standard_normal(&mut rng));
    let spread = rho.mul_add(-rho, 1.0).sqrt();
    Mat::from_fn(n, pattern.nrows(), |i, j| {
        let trait_value = if pattern[(j, 0)] > 0.0 {
            theta[(i, 0)]
        } else {
            rho.mul_add(theta[(i, 0)], spread * theta[(i, 1)])
        };
        let z = 1.3f64.mul_add(trait_value, sample_standard_normal(&mut rng))
            - 0.1 * idx_to_f64(j % 4);
        let level = [0.0, 0.9, 1.8].iter().filter(|cut| z > **cut).count();
        idx_to_f64(level)
    })
}
