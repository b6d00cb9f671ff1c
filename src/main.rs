// Correlate every feature of one matrix with every feature of another, keep the
// strongest significant pairs per feature and store them for per-feature lookup.

use crosscorr::io::{read_feature_matrix, write_results_archive};
use crosscorr::{align_observations, run_and_store, LogProgress, ResultStore, Thresholds};
use log::info;
use std::{
    env,
    error::Error,
    path::{Path, PathBuf},
    str::FromStr,
    time::Instant,
};
use strum_macros::{Display, EnumString};

const USAGE: &str = "Usage:
  crosscorr run <matrix_a> <matrix_b> <store_dir> [num_threads] [--batch-size N] [--limit N]
                [--limit-per-sign N] [--max-q Q] [--min-samples N] [--export] [--time]
  crosscorr query <store_dir> <dataset_a> <dataset_b> <feature_id>
Matrices: tab-separated, one feature per line (.tsv, .gz or .tar.gz)
num_threads: number of threads to use (default: all available)
--export: also write the retained pairs as a .tar.gz TSV next to the table
--time: enable detailed timing output";

#[derive(EnumString, Display)]
#[strum(ascii_case_insensitive)]
enum Command {
    #[strum(serialize = "run")]
    Run,
    #[strum(serialize = "query")]
    Query,
}

struct RunArgs {
    matrix_a: PathBuf,
    matrix_b: PathBuf,
    store_dir: PathBuf,
    thresholds: Thresholds,
    num_threads: Option<usize>,
    export: bool,
    time_tracking: bool,
}

struct QueryArgs {
    store_dir: PathBuf,
    dataset_a: String,
    dataset_b: String,
    feature_id: String,
}

// Accepts both `--flag value` and `--flag=value`.
fn flag_value<'a>(
    args: &'a [String],
    i: &mut usize,
    flag: &str,
) -> Result<Option<&'a str>, Box<dyn Error>> {
    let arg = &args[*i];
    if arg == flag {
        let value = args
            .get(*i + 1)
            .ok_or_else(|| format!("Missing value for {}", flag))?;
        *i += 2;
        return Ok(Some(value.as_str()));
    }
    if let Some(value) = arg.strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')) {
        *i += 1;
        return Ok(Some(value));
    }
    Ok(None)
}

fn parse_value<T: FromStr>(value: &str, flag: &str) -> Result<T, Box<dyn Error>> {
    value
        .parse()
        .map_err(|_| format!("Invalid {} value: {}", flag, value).into())
}

fn parse_run_args(args: &[String]) -> Result<RunArgs, Box<dyn Error>> {
    if args.len() < 3 {
        return Err(USAGE.into());
    }
    let mut run = RunArgs {
        matrix_a: PathBuf::from(&args[0]),
        matrix_b: PathBuf::from(&args[1]),
        store_dir: PathBuf::from(&args[2]),
        thresholds: Thresholds::default(),
        num_threads: None,
        export: false,
        time_tracking: false,
    };

    let mut i = 3;
    while i < args.len() {
        let arg = &args[i];
        if arg == "--time" {
            run.time_tracking = true;
            i += 1;
        } else if arg == "--export" {
            run.export = true;
            i += 1;
        } else if let Some(v) = flag_value(args, &mut i, "--batch-size")? {
            run.thresholds.batch_size = parse_value(v, "--batch-size")?;
        } else if let Some(v) = flag_value(args, &mut i, "--limit-per-sign")? {
            run.thresholds.limit_per_sign = parse_value(v, "--limit-per-sign")?;
        } else if let Some(v) = flag_value(args, &mut i, "--limit")? {
            run.thresholds.limit = parse_value(v, "--limit")?;
        } else if let Some(v) = flag_value(args, &mut i, "--max-q")? {
            run.thresholds.max_q_value = parse_value(v, "--max-q")?;
        } else if let Some(v) = flag_value(args, &mut i, "--min-samples")? {
            run.thresholds.min_samples = parse_value(v, "--min-samples")?;
        } else if let Ok(threads) = arg.parse::<usize>() {
            run.num_threads = Some(threads);
            i += 1;
        } else {
            return Err(format!("Unknown argument: {}", arg).into());
        }
    }
    Ok(run)
}

fn parse_query_args(args: &[String]) -> Result<QueryArgs, Box<dyn Error>> {
    match args {
        [store_dir, dataset_a, dataset_b, feature_id] => Ok(QueryArgs {
            store_dir: PathBuf::from(store_dir),
            dataset_a: dataset_a.clone(),
            dataset_b: dataset_b.clone(),
            feature_id: feature_id.clone(),
        }),
        _ => Err(USAGE.into()),
    }
}

fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    // Configure thread pool
    if let Some(threads) = args.num_threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| format!("Failed to set thread pool: {}", e))?;
        info!("Using {} threads.", threads);
    } else {
        info!("Using all available CPU cores.");
    }

    let load_start = Instant::now();
    let raw_a = read_feature_matrix(&args.matrix_a)?;
    let raw_b = read_feature_matrix(&args.matrix_b)?;
    let (matrix_a, matrix_b) = align_observations(&raw_a, &raw_b)?;
    let load_duration = load_start.elapsed();
    info!(
        "Matrix dimensions: {} x {} features over {} shared observations ({} and {} before alignment)",
        matrix_a.n_features(),
        matrix_b.n_features(),
        matrix_a.n_observations(),
        raw_a.n_observations(),
        raw_b.n_observations()
    );
    drop(raw_a);
    drop(raw_b);

    let calc_start = Instant::now();
    let store = ResultStore::new(&args.store_dir)?;
    let (outcome, handle) =
        run_and_store(&store, &matrix_a, &matrix_b, &args.thresholds, &LogProgress)?;
    let calc_duration = calc_start.elapsed();

    let output_start = Instant::now();
    if args.export {
        let base = format!("{}__{}", matrix_a.dataset().id, matrix_b.dataset().id);
        let archive_path = args
            .store_dir
            .join(format!("{}_pearson_correlations.tar.gz", base));
        write_results_archive(
            &archive_path,
            &format!("{}_pearson_correlations.tsv", base),
            &outcome.results,
        )?;
        info!("Exported retained pairs to {}", archive_path.display());
    }
    let output_duration = output_start.elapsed();

    println!(
        "{} of {} pairs retained in {} chunk(s); table written to {}",
        outcome.results.len(),
        outcome.evaluated_pairs,
        outcome.chunks,
        handle.path.display()
    );

    if args.time_tracking {
        let total_duration = load_duration + calc_duration + output_duration;
        println!(
            "Data loading:           {:8.3} seconds",
            load_duration.as_secs_f64()
        );
        println!(
            "Correlation + storage:  {:8.3} seconds",
            calc_duration.as_secs_f64()
        );
        println!(
            "Export writing:         {:8.3} seconds",
            output_duration.as_secs_f64()
        );
        println!(
            "Total time:             {:8.3} seconds",
            total_duration.as_secs_f64()
        );
    }
    Ok(())
}

fn query(args: QueryArgs) -> Result<(), Box<dyn Error>> {
    if !Path::new(&args.store_dir).is_dir() {
        return Err(format!("Store directory not found: {}", args.store_dir.display()).into());
    }
    let store = ResultStore::new(&args.store_dir)?;
    let hits = store.get_correlations_for(&args.dataset_a, &args.dataset_b, &args.feature_id)?;
    println!("counterpart_id\tcounterpart_label\tcorrelation\tq_value");
    for hit in hits {
        println!(
            "{}\t{}\t{}\t{}",
            hit.counterpart_id, hit.counterpart_label, hit.correlation, hit.q_value
        );
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        return Err(USAGE.into());
    }
    let command: Command = args[1]
        .parse()
        .map_err(|_| format!("Unknown command '{}'\n{}", args[1], USAGE))?;
    info!("crosscorr {}", command);

    match command {
        Command::Run => run(parse_run_args(&args[2..])?),
        Command::Query => query(parse_query_args(&args[2..])?),
    }
}
