use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction};
use facesync::{
    DataDir,
    Error,
    IndexStore,
    Result,
    SyncConfig,
    clustering::HierarchicalClusterer,
    config::SETTING_KEYS,
    index_store::{FILES_INDEX, LIBRARY_INDEX},
    people,
    types::FileMlRecord,
};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("FACESYNC_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    if !data_dir.has_index() {
        tracing::info!(path = %data_dir.index_db().display(), "creating index");
    }
    let store = IndexStore::open(&data_dir.index_db())?;

    match cli.command {
        Command::Status(args) => cmd_status(&store, &data_dir, args.json)?,
        Command::Files(args) => cmd_files(&store, &args)?,
        Command::Show(args) => cmd_show(&store, args.file_id, args.json)?,
        Command::ResetErrors(args) => {
            let ids = (!args.file_ids.is_empty()).then_some(&args.file_ids[..]);
            let reset = store.reset_error_counts(ids)?;
            println!("Reset error state of {reset} file(s)");
        }
        Command::Clusters(args) => cmd_clusters(&store, args.json)?,
        Command::Recluster(args) => cmd_recluster(&store, args.json)?,
        Command::Config { action } => match action {
            ConfigAction::Show { json } => config_show(&store, json)?,
            ConfigAction::Set { key, value } => {
                config_set(&store, &key, &value)?
            }
            ConfigAction::Clear { key } => {
                if !store.remove_setting(&key)? {
                    return Err(Error::NotFound {
                        kind: "setting",
                        name: key,
                    });
                }
                println!("Cleared '{key}'");
            }
        },
        Command::Completions(_) => {}
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_status(
    store: &IndexStore,
    data_dir: &DataDir,
    json: bool,
) -> Result<()> {
    let config = SyncConfig::load(store)?;
    let stats = store.sync_stats(config.ml_version, config.max_error_count)?;
    let library = store.get_library_data()?.unwrap_or_default();

    if json {
        return print_json(&serde_json::json!({
            "data_dir": data_dir.root(),
            "schema_version": store.schema_version()?,
            "ml_version": config.ml_version,
            "files": stats,
            "files_index_version": store.index_version(FILES_INDEX)?,
            "library_index_version": store.index_version(LIBRARY_INDEX)?,
            "clusters": library.cluster_count(),
            "noise": library.noise_count(),
        }));
    }

    println!("Data directory: {}", data_dir.root().display());
    println!("Schema version: {}", store.schema_version()?);
    println!("Target ML version: {}", config.ml_version);
    println!("Files: {}", stats.total);
    println!("  synced: {}", stats.synced);
    println!("  pending: {}", stats.pending);
    println!("  quarantined: {}", stats.quarantined);
    match library.face_clustering_results {
        Some(ref results) => println!(
            "People: {} clusters, {} unclustered faces",
            results.clusters.len(),
            results.noise.len()
        ),
        None => println!("People: not indexed yet"),
    }
    Ok(())
}

fn cmd_files(store: &IndexStore, args: &cli::FilesArgs) -> Result<()> {
    let config = SyncConfig::load(store)?;
    let target = config.ml_version;
    let max = config.max_error_count;
    let files: Vec<FileMlRecord> = store
        .list_files()?
        .into_iter()
        .filter(|r| {
            if args.pending {
                r.needs_sync(target, max)
            } else if args.quarantined {
                r.ml_version != target && r.error_count >= max
            } else {
                true
            }
        })
        .collect();

    if args.json {
        return print_json(&files);
    }
    if files.is_empty() {
        println!("No matching files.");
        return Ok(());
    }
    for r in &files {
        println!(
            "{}\tv{}\terrors={}\tfaces={}\t{}",
            r.file_id,
            r.ml_version,
            r.error_count,
            r.faces.len(),
            r.last_error_message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn cmd_show(store: &IndexStore, file_id: u64, json: bool) -> Result<()> {
    let record = store.get_file(file_id)?.ok_or_else(|| Error::NotFound {
        kind: "file",
        name: file_id.to_string(),
    })?;

    if json {
        return print_json(&record);
    }

    println!("File: {}", record.file_id);
    println!("ML version: {}", record.ml_version);
    println!("Errors: {}", record.error_count);
    if let Some(msg) = &record.last_error_message {
        println!("Last error: {msg}");
    }
    if let Some(dims) = record.image_dimensions {
        println!("Image: {}x{}", dims.width, dims.height);
    }
    println!("Faces: {}", record.faces.len());
    for face in &record.faces {
        let b = &face.detection.bbox;
        let crop = if store.get_face_crop(&face.id)?.is_some() {
            "crop"
        } else {
            "no crop"
        };
        println!(
            "  {}  box=({:.3}, {:.3}, {:.3}, {:.3})  p={:.2}  {crop}",
            face.id, b.x, b.y, b.width, b.height, face.detection.probability
        );
    }
    Ok(())
}

fn cmd_clusters(store: &IndexStore, json: bool) -> Result<()> {
    let library = store.get_library_data()?.unwrap_or_default();

    if json {
        return print_json(&library);
    }
    let Some(results) = &library.face_clustering_results else {
        println!("No clusters yet.");
        return Ok(());
    };
    println!(
        "Method: {}",
        library.face_clustering_method.as_deref().unwrap_or("unknown")
    );
    for (i, cluster) in results.clusters.iter().enumerate() {
        println!("#{i}\t{} faces\t{}", cluster.len(), cluster.join(" "));
    }
    println!("Noise: {} faces", results.noise.len());
    Ok(())
}

fn cmd_recluster(store: &IndexStore, json: bool) -> Result<()> {
    let config = SyncConfig::load(store)?;
    let clusterer = HierarchicalClusterer::from_config(&config);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let library = runtime.block_on(people::index_people(store, &clusterer))?;

    if json {
        return print_json(&library);
    }
    println!(
        "Clustered {} faces into {} clusters ({} noise)",
        library.clustered_face_count,
        library.cluster_count().unwrap_or(0),
        library.noise_count().unwrap_or(0)
    );
    Ok(())
}

fn config_show(store: &IndexStore, json: bool) -> Result<()> {
    let config = SyncConfig::load(store)?;
    if json {
        return print_json(&config);
    }

    let stored = store.list_settings()?;
    let value = serde_json::to_value(&config)?;
    for key in SETTING_KEYS {
        let source = if stored.iter().any(|(k, _)| k == key) {
            " (stored)"
        } else {
            ""
        };
        println!("{key} = {}{source}", value[*key]);
    }
    Ok(())
}

fn config_set(store: &IndexStore, key: &str, value: &str) -> Result<()> {
    let mut config = SyncConfig::load(store)?;
    config.apply(key, value)?;
    config.validate()?;
    store.set_setting(key, value.trim())?;
    println!("Set {key} = {}", value.trim());
    Ok(())
}
