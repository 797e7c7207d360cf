use std::num::{NonZeroU16, NonZeroUsize};
use std::path::PathBuf;

use byte_unit::Byte;
use clap::Parser;
use tokio::{runtime::Builder, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bytepump::{
    config::{self, ConcurrencyMode, Partial, PumpMode, WriteMode},
    controller, exit,
    integrity::HashAlgo,
    signals::Shutdown,
    target,
};
use bytepump_payload::{dict, encoding::Encoding, NewlineScope, NewlineStyle};

#[derive(Parser, Debug)]
#[clap(version, about = "A guard-railed synthetic file pumper", long_about = None)]
struct Opts {
    /// target path; `-` writes to standard output
    target: Option<String>,
    /// path on disk to a JSON, YAML or TOML configuration file
    #[clap(long)]
    config: Option<PathBuf>,
    /// file naming one target path per line; `#` lines ignored
    #[clap(long)]
    filelist: Option<PathBuf>,
    /// directory to fan numbered targets out under
    #[clap(long)]
    dir: Option<PathBuf>,
    /// how many targets to create under --dir
    #[clap(long, default_value_t = 1)]
    dir_files: u32,
    /// file name template under --dir; %NNN% becomes the index
    #[clap(long, default_value = "pump-%NNN%.dat")]
    dir_template: String,
    /// disposition preset: normal-write, normal-append, binary-write, binary-append
    #[clap(long)]
    write_mode: Option<WriteMode>,
    /// which generator produces bytes
    #[clap(long)]
    pump_mode: Option<PumpMode>,
    /// the fixed token for word mode
    #[clap(long)]
    word: Option<String>,
    /// dictionary file, one token per line; repeatable
    #[clap(long)]
    dict: Vec<PathBuf>,
    /// file naming dictionary files, one per line; repeatable
    #[clap(long)]
    dict_list: Vec<PathBuf>,
    /// dictionary draw order: sequential, reverse, presorted, random
    #[clap(long)]
    dict_order: Option<dict::Order>,
    /// n-gram window for markov mode
    #[clap(long)]
    ngram: Option<NonZeroUsize>,
    /// text encoding: utf8, latin1, utf16le, utf16be; default auto-detects
    #[clap(long)]
    encoding: Option<Encoding>,
    /// newline scope: none, word, char
    #[clap(long)]
    newline_mode: Option<NewlineScope>,
    /// newline style: lf, cr, crlf
    #[clap(long)]
    newline_style: Option<NewlineStyle>,
    /// emit exactly this many tokens
    #[clap(long)]
    times: Option<u64>,
    /// lower bound of a seeded times draw, inclusive
    #[clap(long)]
    times_min: Option<u64>,
    /// upper bound of a seeded times draw, inclusive
    #[clap(long)]
    times_max: Option<u64>,
    /// emit exactly this many bytes
    #[clap(long)]
    size: Option<Byte>,
    /// authoritative byte ceiling over every other bound
    #[clap(long)]
    max_bytes: Option<Byte>,
    /// generation and write unit
    #[clap(long)]
    chunk: Option<Byte>,
    /// concurrency flavor: single, write, generate
    #[clap(long)]
    concurrency: Option<ConcurrencyMode>,
    /// writer tasks under --concurrency write
    #[clap(long)]
    workers: Option<NonZeroU16>,
    /// generator tasks under --concurrency generate
    #[clap(long)]
    generators: Option<NonZeroU16>,
    /// buffer everything in RAM and dump once
    #[clap(long, action)]
    ram_buffer: bool,
    /// largest estimate --ram-buffer will take on before streaming instead
    #[clap(long)]
    ram_max: Option<Byte>,
    /// hard RSS ceiling; exceeding it is fatal
    #[clap(long)]
    ram_limit: Option<Byte>,
    /// throughput ceiling in bytes per second
    #[clap(long)]
    rate: Option<Byte>,
    /// process CPU ceiling in percent
    #[clap(long)]
    cpu: Option<u8>,
    /// fsync periodically and at close
    #[clap(long, action)]
    fsync: bool,
    /// bytes between periodic fsyncs
    #[clap(long)]
    fsync_interval: Option<Byte>,
    /// hash algorithm over written bytes: md5, sha1, sha256, sha512
    #[clap(long)]
    hash: Option<HashAlgo>,
    /// re-read the file after close and compare digests
    #[clap(long, action)]
    verify: bool,
    /// wrap output in a gzip container
    #[clap(long, action)]
    gzip: bool,
    /// skip writes of all-zero chunks, leaving holes
    #[clap(long, action)]
    sparse: bool,
    /// continue a previous size-bound run from EOF
    #[clap(long, action)]
    resume: bool,
    /// absolute start offset in the target
    #[clap(long)]
    offset: Option<Byte>,
    /// truncate the target to this length before writing
    #[clap(long)]
    truncate_to: Option<Byte>,
    /// preallocate the target to this length before writing
    #[clap(long)]
    fallocate_to: Option<Byte>,
    /// write retries per chunk
    #[clap(long)]
    io_retries: Option<u32>,
    /// failed write attempts tolerated across the whole job
    #[clap(long)]
    error_budget: Option<u64>,
    /// seed for every random draw this job makes
    #[clap(long)]
    seed: Option<u64>,
    /// seconds between progress reports
    #[clap(long)]
    progress_interval: Option<u64>,
    /// abort before opening anything when times exceed this
    #[clap(long)]
    max_times: Option<u64>,
    /// skip the free-space pre-check
    #[clap(long, action)]
    no_disk_guard: bool,
}

impl Opts {
    fn to_partial(&self) -> Partial {
        Partial {
            write_mode: self.write_mode,
            pump_mode: self.pump_mode,
            word: self.word.clone(),
            dict: (!self.dict.is_empty()).then(|| self.dict.clone()),
            dict_list: (!self.dict_list.is_empty()).then(|| self.dict_list.clone()),
            dict_order: self.dict_order,
            ngram: self.ngram,
            encoding: self.encoding,
            newline_mode: self.newline_mode,
            newline_style: self.newline_style,
            times: self.times,
            times_min: self.times_min,
            times_max: self.times_max,
            size: self.size,
            max_bytes: self.max_bytes,
            chunk: self.chunk,
            concurrency: self.concurrency,
            workers: self.workers,
            generators: self.generators,
            ram_buffer: self.ram_buffer.then_some(true),
            ram_max: self.ram_max,
            ram_limit: self.ram_limit,
            rate: self.rate,
            cpu: self.cpu,
            fsync: self.fsync.then_some(true),
            fsync_interval: self.fsync_interval,
            hash: self.hash,
            verify: self.verify.then_some(true),
            gzip: self.gzip.then_some(true),
            sparse: self.sparse.then_some(true),
            resume: self.resume.then_some(true),
            offset: self.offset,
            truncate_to: self.truncate_to,
            fallocate_to: self.fallocate_to,
            io_retries: self.io_retries,
            error_budget: self.error_budget,
            seed: self.seed,
            progress_interval: self.progress_interval,
            max_times: self.max_times,
            no_disk_guard: self.no_disk_guard.then_some(true),
        }
    }
}

async fn inner_main(
    config: config::JobConfig,
    targets: Vec<target::Target>,
    shutdown: Shutdown,
) -> i32 {
    let mut job = tokio::spawn(controller::run_job(config, targets, shutdown.clone()));

    let result = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            shutdown.signal();
            job.await
        }
        res = &mut job => res,
    };

    match result {
        Ok(Ok(())) => exit::SUCCESS,
        Ok(Err(err)) => {
            error!("{err}");
            err.exit_code()
        }
        Err(join) => {
            error!("job panicked: {join}");
            exit::FAILURE
        }
    }
}

fn main() {
    // Payload may go to standard output, so every log line goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let opts: Opts = Opts::parse();

    let partial = match &opts.config {
        Some(path) => match config::load_file(path) {
            Ok(partial) => partial,
            Err(err) => {
                error!("{err}");
                std::process::exit(exit::FAILURE);
            }
        },
        None => Partial::default(),
    };
    let config = match partial.overlay(opts.to_partial()).resolve() {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            std::process::exit(exit::FAILURE);
        }
    };

    let dir = opts.dir.as_deref().map(|root| (root, opts.dir_files));
    let targets = match target::resolve(
        opts.target.as_deref(),
        opts.filelist.as_deref(),
        dir,
        &opts.dir_template,
    ) {
        Ok(targets) => targets,
        Err(err) => {
            error!("{err}");
            std::process::exit(exit::FAILURE);
        }
    };

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("runtime construction cannot fail with these options");
    let shutdown = Shutdown::new();
    let code = runtime.block_on(inner_main(config, targets, shutdown));
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_flags_stay_unset_in_the_partial() {
        let opts = Opts::parse_from(["bytepump", "out.txt", "--word", "x", "--times", "1"]);
        let partial = opts.to_partial();
        assert_eq!(partial.word.as_deref(), Some("x"));
        assert_eq!(partial.gzip, None);
        assert_eq!(partial.dict, None);
        assert_eq!(partial.no_disk_guard, None);
    }

    #[test]
    fn sizes_parse_human_units() {
        let opts = Opts::parse_from(["bytepump", "out.bin", "--size", "100MiB", "--rate", "10MiB"]);
        assert_eq!(opts.size.unwrap().get_bytes(), 100 * 1024 * 1024);
        assert_eq!(opts.rate.unwrap().get_bytes(), 10 * 1024 * 1024);
    }

    #[test]
    fn repeated_dict_options_accumulate() {
        let opts = Opts::parse_from([
            "bytepump",
            "out.txt",
            "--pump-mode",
            "dict",
            "--dict",
            "a.txt",
            "--dict",
            "b.txt",
            "--times",
            "1",
        ]);
        assert_eq!(opts.dict.len(), 2);
    }
}
