//! The job controller: resolves what one run means, consults the guards,
//! assembles a token source and a writer backend per target and drives the
//! targets strictly in sequence.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use bytepump_payload::Builder;
use bytepump_throttle::{Config as ThrottleConfig, Throttle};
use metrics::gauge;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{error, info, warn};

use crate::config::{ConcurrencyModel, JobConfig};
use crate::monitor::ResourceMonitor;
use crate::progress::{self, Progress};
use crate::signals::Shutdown;
use crate::target::Target;
use crate::writer::{self, buffer, multi, pipeline, stream, Budget, GenState, Outcome, RetryState};
use crate::{guard, integrity, Error};

/// Run one job over its resolved target set.
///
/// Targets are processed strictly sequentially. A failing target does not
/// stop the ones after it; the first error becomes the job's result.
/// Interruption stops the whole job.
///
/// # Errors
///
/// The first error encountered, per the taxonomy in [`Error`].
pub async fn run_job(
    config: JobConfig,
    targets: Vec<Target>,
    shutdown: Shutdown,
) -> Result<(), Error> {
    if targets.is_empty() {
        return Err(Error::NoTargets);
    }

    let builder = Builder::new(&config.payload, &config.text)?;
    let mean_token_len = builder.mean_token_len();

    let master_seed = config.seed.unwrap_or_else(|| rand::thread_rng().gen());
    let mut job_rng = StdRng::seed_from_u64(master_seed);

    // Effective times are drawn up front so the guards see what will run.
    let mut plan = Vec::with_capacity(targets.len());
    for target in targets {
        let times = config.effective_times(&mut job_rng);
        guard::check_max_times(times, config.max_times)?;
        plan.push((target, times));
    }

    if config.disk_guard {
        let expectations: Vec<(Target, u64)> = plan
            .iter()
            .map(|(target, times)| {
                (
                    target.clone(),
                    config.expected_bytes(*times, mean_token_len),
                )
            })
            .collect();
        guard::check_disk(&expectations)?;
    }

    let mut first_error: Option<Error> = None;
    for (index, (target, times)) in plan.into_iter().enumerate() {
        if shutdown.is_signaled() {
            first_error.get_or_insert(Error::Interrupted);
            break;
        }
        // Stride targets far apart so per-worker offsets never collide.
        let target_seed = master_seed.wrapping_add((index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        match run_target(
            &config,
            &builder,
            &target,
            times,
            target_seed,
            shutdown.clone(),
        )
        .await
        {
            Ok(outcome) => {
                info!(
                    target = %target,
                    bytes = outcome.bytes,
                    tokens = outcome.tokens,
                    digest = outcome.digest.as_deref().unwrap_or("-"),
                    "target complete"
                );
                if outcome.interrupted {
                    first_error.get_or_insert(Error::Interrupted);
                    break;
                }
            }
            Err(err) => {
                error!(target = %target, error = %err, "target failed");
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn run_target(
    config: &JobConfig,
    builder: &Builder,
    target: &Target,
    times: Option<u64>,
    target_seed: u64,
    shutdown: Shutdown,
) -> Result<Outcome, Error> {
    let effective = effective_for(config, target);
    let mean_token_len = builder.mean_token_len();
    let estimate = effective.expected_bytes(times, mean_token_len);

    if effective.disk_guard {
        if let Some(path) = target.path() {
            guard::recheck_target(path, estimate)?;
        }
    }

    let byte_ceiling = effective.byte_ceiling();
    let progress_bytes = Arc::new(AtomicU64::new(0));
    let opened =
        writer::open_target(target, &effective, byte_ceiling, Arc::clone(&progress_bytes)).await?;
    let start = opened.start;
    let head = opened.head;

    let budget = Arc::new(Budget::new(times));
    let retry = RetryState::new(effective.io_retries, effective.error_budget);
    let throttle = Arc::new(match effective.rate {
        Some(rate) => {
            let labels = vec![
                ("component".to_string(), "writer".to_string()),
                ("target".to_string(), target.to_string()),
            ];
            gauge!("bytes_per_second", f64::from(rate.get()), &labels);
            Throttle::new_with_config(ThrottleConfig::default(), rate)
        }
        None => Throttle::all_out(),
    });
    let tokens_per_chunk = mean_token_len.map_or(1, |len| {
        (effective.chunk.get() / len.get()).max(1) as u64
    });
    let gen_for = |worker: u64| {
        GenState::new(
            builder.source(target_seed.wrapping_add(worker)),
            Arc::clone(&budget),
            effective.chunk,
            tokens_per_chunk,
        )
    };
    let monitor_for = |shares: u32| {
        ResourceMonitor::new(
            effective.cpu_percent,
            effective.ram_limit,
            effective.progress_interval,
            shares,
        )
    };

    let reporter_done = Shutdown::new();
    let reporter = tokio::spawn(progress::report(
        Progress::new(
            target.to_string(),
            progress_bytes,
            Some(byte_ceiling.unwrap_or(estimate)),
            effective.progress_interval,
        ),
        reporter_done.clone(),
    ));

    let result = match effective.model {
        ConcurrencyModel::RamBuffer if estimate <= effective.ram_max => {
            buffer::run(
                gen_for(0),
                head,
                estimate,
                throttle,
                monitor_for(1),
                retry.clone(),
                shutdown,
            )
            .await
        }
        ConcurrencyModel::RamBuffer => {
            info!(
                estimate,
                ram_max = effective.ram_max,
                "estimate exceeds ram-max; streaming instead"
            );
            stream::run(
                gen_for(0),
                head,
                throttle,
                monitor_for(1),
                retry.clone(),
                shutdown,
            )
            .await
        }
        ConcurrencyModel::MultiWriter(workers) => {
            let gens = (0..workers)
                .map(|worker| (gen_for(u64::from(worker)), monitor_for(u32::from(workers))))
                .collect();
            multi::run(gens, head, throttle, retry.clone(), shutdown).await
        }
        ConcurrencyModel::Pipeline(generators) => {
            let gens = (0..generators)
                .map(|generator| gen_for(u64::from(generator)))
                .collect();
            pipeline::run(
                gens,
                Arc::clone(&budget),
                head,
                throttle,
                monitor_for(1),
                retry.clone(),
                shutdown,
            )
            .await
        }
        ConcurrencyModel::Single => {
            stream::run(
                gen_for(0),
                head,
                throttle,
                monitor_for(1),
                retry.clone(),
                shutdown,
            )
            .await
        }
    };

    reporter_done.signal();
    let _ = reporter.await;
    let outcome = result?;

    if effective.verify && !outcome.interrupted {
        if let (Some(path), Some(algo), Some(written)) =
            (target.path(), effective.hash, outcome.digest.as_deref())
        {
            let reread = integrity::digest_file(path, start, algo)
                .await
                .map_err(writer::Error::Io)?;
            if reread != written {
                return Err(Error::Verify {
                    written: written.to_string(),
                    reread,
                });
            }
            info!(target = %target, digest = written, "verification passed");
        }
    }

    Ok(outcome)
}

/// Stdout cannot seek, hold holes, preallocate or be re-read; those options
/// are silently disabled for it.
fn effective_for(config: &JobConfig, target: &Target) -> JobConfig {
    let mut effective = config.clone();
    if matches!(target, Target::Stdout) {
        if effective.verify {
            warn!("verification skipped for standard output");
        }
        effective.disk_guard = false;
        effective.sparse = false;
        effective.verify = false;
        effective.resume = false;
        effective.offset = None;
        effective.truncate_to = None;
        effective.fallocate_to = None;
    }
    effective
}
