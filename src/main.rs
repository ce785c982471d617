//! chkmap CLI - Command line interface for chkmap stores
//!
//! Each named ref points at the root of one map. Mutating commands save the
//! map and move the ref. Map parameters live in `<store>.json`.

use chkmap::{
    diff_maps, logging, ChkKey, ChkMap, DiffEntry, FileStore, Key, MapConfig, SearchKeyFunc,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chkmap")]
#[command(about = "A persistent content-addressed trie for versioned snapshots")]
#[command(version)]
struct Cli {
    /// Path to the store file
    #[arg(short, long, default_value = "maps.chk", global = true)]
    store: PathBuf,

    /// Output format (json or text)
    #[arg(short, long, default_value = "json", global = true)]
    format: OutputFormat,

    /// Ref holding the map to work on
    #[arg(short, long = "ref", default_value = "main", global = true)]
    reference: String,

    /// Log level or filter directive (overridden by CHKMAP_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new store with an empty map
    Init {
        /// Serialized size a leaf may reach before it splits
        #[arg(long, default_value_t = chkmap::config::DEFAULT_MAXIMUM_SIZE)]
        maximum_size: usize,
        /// Number of elements in every key
        #[arg(long, default_value_t = 1)]
        key_width: usize,
        /// Search key function: plain, hash-16-way or hash-255-way
        #[arg(long, default_value = "plain")]
        search_key: SearchKeyFunc,
    },

    /// Map a key to a value
    Put {
        /// Key elements followed by the value
        #[arg(required = true, num_args = 2..)]
        args: Vec<String>,
    },

    /// Show the value of a key
    Get {
        /// Key elements
        #[arg(required = true)]
        key: Vec<String>,
    },

    /// Remove a key
    Delete {
        /// Key elements
        #[arg(required = true)]
        key: Vec<String>,
    },

    /// List items, optionally only those whose key starts with the given
    /// elements
    List {
        /// Leading key elements
        prefix: Vec<String>,
    },

    /// Show the changes between two refs (or root keys)
    Diff {
        /// Basis ref
        from: String,
        /// New ref
        to: String,
    },

    /// Render the page tree
    Dump {
        /// Include page keys
        #[arg(long)]
        keys: bool,
    },

    /// Show store and map status
    Status,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level.as_deref())?;

    match &cli.command {
        Commands::Init {
            maximum_size,
            key_width,
            search_key,
        } => {
            let config = MapConfig {
                maximum_size: *maximum_size,
                key_width: *key_width,
                search_key: *search_key,
                ..MapConfig::default()
            };
            config.validate()?;
            let store = FileStore::create(&cli.store)?;
            config.save(&cli.store)?;
            let root = ChkMap::with_config(&store, None, &config).save()?;
            store.set_ref(&cli.reference, root);
            store.sync()?;
            output(
                cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "message": format!("Created store at {}", cli.store.display()),
                    "ref": cli.reference,
                    "root": root.to_string()
                }),
            )?;
        }

        Commands::Put { args } => {
            let (value, elements) = args
                .split_last()
                .ok_or_else(|| anyhow::anyhow!("Missing value"))?;
            let (store, config) = open_store(&cli)?;
            let mut map = ChkMap::with_config(&store, store.get_ref(&cli.reference), &config);
            map.map(to_key(elements), value.as_bytes())?;
            let root = map.save()?;
            store.set_ref(&cli.reference, root);
            store.sync()?;
            output(
                cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "root": root.to_string()
                }),
            )?;
        }

        Commands::Get { key } => {
            let (store, config) = open_store(&cli)?;
            let map = ChkMap::with_config(&store, store.get_ref(&cli.reference), &config);
            match map.get(&to_key(key))? {
                Some(value) => {
                    output(
                        cli.format,
                        &serde_json::json!({
                            "key": key,
                            "value": String::from_utf8_lossy(&value)
                        }),
                    )?;
                }
                None => {
                    output(
                        cli.format,
                        &serde_json::json!({
                            "status": "error",
                            "message": format!("Key not found: {}", to_key(key))
                        }),
                    )?;
                    std::process::exit(1);
                }
            }
        }

        Commands::Delete { key } => {
            let (store, config) = open_store(&cli)?;
            let mut map = ChkMap::with_config(&store, store.get_ref(&cli.reference), &config);
            map.unmap(&to_key(key))?;
            let root = map.save()?;
            store.set_ref(&cli.reference, root);
            store.sync()?;
            output(
                cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "root": root.to_string()
                }),
            )?;
        }

        Commands::List { prefix } => {
            let (store, config) = open_store(&cli)?;
            let map = ChkMap::with_config(&store, store.get_ref(&cli.reference), &config);
            let filter = if prefix.is_empty() {
                None
            } else {
                Some(vec![to_key(prefix)])
            };
            let mut items = Vec::new();
            for item in map.iteritems(filter.as_deref()) {
                items.push(item?);
            }
            items.sort();
            let items: Vec<_> = items
                .iter()
                .map(|(key, value)| {
                    serde_json::json!({
                        "key": key_elements(key),
                        "value": String::from_utf8_lossy(value)
                    })
                })
                .collect();
            output(
                cli.format,
                &serde_json::json!({
                    "count": items.len(),
                    "items": items
                }),
            )?;
        }

        Commands::Diff { from, to } => {
            let (store, config) = open_store(&cli)?;
            let from_root = resolve_ref(&store, from)?;
            let to_root = resolve_ref(&store, to)?;
            let basis = ChkMap::with_config(&store, Some(from_root), &config);
            let new = ChkMap::with_config(&store, Some(to_root), &config);
            let diff = diff_maps(&new, &basis)?;

            let entries: Vec<_> = diff
                .entries
                .iter()
                .map(|e| {
                    let change = match e {
                        DiffEntry::Added { .. } => "added",
                        DiffEntry::Removed { .. } => "removed",
                        DiffEntry::Modified { .. } => "modified",
                    };
                    serde_json::json!({
                        "type": change,
                        "key": key_elements(e.key()),
                        "old": e.old_value().map(String::from_utf8_lossy),
                        "new": e.new_value().map(String::from_utf8_lossy)
                    })
                })
                .collect();
            output(
                cli.format,
                &serde_json::json!({
                    "from": from_root.to_string(),
                    "to": to_root.to_string(),
                    "added": diff.added_count(),
                    "removed": diff.removed_count(),
                    "modified": diff.modified_count(),
                    "entries": entries
                }),
            )?;
        }

        Commands::Dump { keys } => {
            let (store, config) = open_store(&cli)?;
            let map = ChkMap::with_config(&store, store.get_ref(&cli.reference), &config);
            let tree = map.dump_tree(*keys)?;
            match cli.format {
                OutputFormat::Text => print!("{}", tree),
                OutputFormat::Json => output(cli.format, &serde_json::json!({ "tree": tree }))?,
            }
        }

        Commands::Status => {
            let (store, config) = open_store(&cli)?;
            let root = store.get_ref(&cli.reference);
            let map = ChkMap::with_config(&store, root, &config);
            let refs: Vec<_> = store
                .list_refs()
                .into_iter()
                .map(|(name, key)| serde_json::json!({ "name": name, "root": key.to_string() }))
                .collect();
            output(
                cli.format,
                &serde_json::json!({
                    "store": cli.store.display().to_string(),
                    "ref": cli.reference,
                    "root": root.map(|k| k.to_string()),
                    "items": map.len()?,
                    "records": store.record_count(),
                    "refs": refs,
                    "config": config
                }),
            )?;
        }
    }

    Ok(())
}

fn open_store(cli: &Cli) -> anyhow::Result<(FileStore, MapConfig)> {
    let store = FileStore::open_or_create(&cli.store)?;
    let config = MapConfig::load(&cli.store)?;
    Ok((store, config))
}

fn to_key(elements: &[String]) -> Key {
    Key::new(elements.iter().map(|e| e.as_bytes().to_vec()).collect())
}

fn key_elements(key: &Key) -> Vec<String> {
    key.elements()
        .iter()
        .map(|e| String::from_utf8_lossy(e).into_owned())
        .collect()
}

fn output(format: OutputFormat, value: &serde_json::Value) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(value)?),
        OutputFormat::Text => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

/// A ref name, or a literal `sha1:` root key
fn resolve_ref(store: &FileStore, reference: &str) -> anyhow::Result<ChkKey> {
    if let Some(key) = store.get_ref(reference) {
        return Ok(key);
    }
    ChkKey::parse(reference.as_bytes())
        .map_err(|_| anyhow::anyhow!("Invalid reference: {}", reference))
}
