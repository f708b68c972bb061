use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::blocklist::BlockStore;
use crate::config::Config;

/// Build a fresh block store from the configured deny lists. The returned
/// store is swapped in wholesale by the caller; in-flight queries keep the
/// snapshot they already hold.
///
/// Downloads only happen when `force` is set or the sources store is absent
/// on disk; otherwise the previously fetched lists are reused.
pub async fn perform_update(config: &Config, force: bool) -> std::io::Result<BlockStore> {
    let store = BlockStore::new();
    let blocking = &config.blocking;

    if force || !Path::new(&blocking.sources_store).exists() {
        update(
            &store,
            &blocking.whitelist,
            &blocking.blocklist,
            &blocking.sources,
            &blocking.sources_store,
        )
        .await?;
    } else {
        // Manual entries still apply when downloads are skipped.
        for entry in &blocking.blocklist {
            store.set(entry);
        }
    }

    // The sources store always participates so freshly fetched lists are
    // actually used for blocking.
    let mut source_dirs = blocking.source_dirs.clone();
    if !source_dirs.contains(&blocking.sources_store) {
        source_dirs.push(blocking.sources_store.clone());
    }

    let whitelist: HashSet<String> = blocking.whitelist.iter().cloned().collect();
    load_source_dirs(&store, &source_dirs, &whitelist)?;

    info!("{} exact domains loaded from sources", store.len());
    Ok(store)
}

/// Seed manual entries and download every source into the store directory.
/// A failing source is logged and skipped; only filesystem problems with
/// the store itself are errors.
async fn update(
    store: &BlockStore,
    whitelist: &[String],
    blocklist: &[String],
    sources: &[String],
    sources_store: &str,
) -> std::io::Result<()> {
    ensure_sources_store(sources_store)?;

    let whitelisted: HashSet<&String> = whitelist.iter().collect();
    for entry in blocklist {
        if !whitelisted.contains(entry) {
            store.set(entry);
        }
    }

    fetch_sources(sources, sources_store).await;
    Ok(())
}

fn ensure_sources_store(sources_store: &str) -> std::io::Result<()> {
    let path = Path::new(sources_store);
    if path.exists() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new().mode(0o700).create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir(path)
    }
}

/// Pair every source URL with its on-disk name `<host>.<n>.list`, where `n`
/// counts repeated hosts.
fn source_file_names(sources: &[String]) -> Vec<(String, String)> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    sources
        .iter()
        .map(|uri| {
            let host = reqwest::Url::parse(uri)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            let n = seen.entry(host.clone()).or_insert(0);
            *n += 1;
            (uri.clone(), format!("{}.{}.list", host, n))
        })
        .collect()
}

async fn fetch_sources(sources: &[String], sources_store: &str) {
    let client = reqwest::Client::builder()
        .user_agent(concat!("vordr/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default();

    let mut downloads = JoinSet::new();
    for (uri, file_name) in source_file_names(sources) {
        let client = client.clone();
        let dest = PathBuf::from(sources_store).join(file_name);

        downloads.spawn(async move {
            debug!("fetching source {}", uri);
            if let Err(err) = download_file(&client, &uri, &dest).await {
                // Partial failure is tolerated; the remaining lists still
                // make a usable store.
                warn!("error downloading source {}: {}", uri, err);
            }
        });
    }

    while downloads.join_next().await.is_some() {}
}

async fn download_file(
    client: &reqwest::Client,
    uri: &str,
    dest: &Path,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let response = client.get(uri).send().await?;
    if !response.status().is_success() {
        return Err(format!("http status {}", response.status()).into());
    }
    let body = response.bytes().await?;
    tokio::fs::write(dest, &body).await?;
    Ok(())
}

/// Walk every directory and parse each regular file as a hosts file.
/// Missing directories are logged and skipped.
fn load_source_dirs(
    store: &BlockStore,
    source_dirs: &[String],
    whitelist: &HashSet<String>,
) -> std::io::Result<()> {
    debug!("loading blocked domains from {} locations", source_dirs.len());

    for dir in source_dirs {
        let dir = Path::new(dir);
        if !dir.exists() {
            error!("directory {} not found, skipping", dir.display());
            continue;
        }
        walk_dir(dir, store, whitelist)?;
    }
    Ok(())
}

fn walk_dir(dir: &Path, store: &BlockStore, whitelist: &HashSet<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_dir(&path, store, whitelist)?;
        } else {
            parse_hosts_file(&path, store, whitelist)?;
        }
    }
    Ok(())
}

/// Hosts-file parse: strip `#` comments, take the second field when an IP
/// column is present, skip whitelisted names.
fn parse_hosts_file(
    path: &Path,
    store: &BlockStore,
    whitelist: &HashSet<String>,
) -> std::io::Result<()> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    for line in reader.lines() {
        let line = line?;
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let name = if fields.len() > 1 { fields[1] } else { fields[0] };

        if !store.exists(name) && !whitelist.contains(name) {
            store.set(name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_list(dir: &Path, name: &str, contents: &str) {
        let mut file = File::create(dir.join(name)).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    fn config_for(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.blocking.sources = Vec::new();
        config.blocking.sources_store = dir.path().to_str().unwrap().to_string();
        config.blocking.source_dirs = Vec::new();
        config
    }

    #[test]
    fn hosts_lines_pick_the_domain_field() {
        let dir = TempDir::new().unwrap();
        write_list(
            dir.path(),
            "hosts.1.list",
            "# a comment\n\
             0.0.0.0 ads.example.com\n\
             tracker.example.com\n\
             127.0.0.1 metrics.example.com # trailing comment\n\
             \n",
        );

        let store = BlockStore::new();
        parse_hosts_file(
            &dir.path().join("hosts.1.list"),
            &store,
            &HashSet::new(),
        )
        .unwrap();

        assert!(store.exists("ads.example.com"));
        assert!(store.exists("tracker.example.com"));
        assert!(store.exists("metrics.example.com"));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn whitelisted_names_are_skipped() {
        let dir = TempDir::new().unwrap();
        write_list(
            dir.path(),
            "list.1.list",
            "0.0.0.0 allowed.example\n0.0.0.0 denied.example\n",
        );

        let store = BlockStore::new();
        let whitelist: HashSet<String> = ["allowed.example".to_string()].into_iter().collect();
        parse_hosts_file(&dir.path().join("list.1.list"), &store, &whitelist).unwrap();

        assert!(!store.exists("allowed.example"));
        assert!(store.exists("denied.example"));
    }

    #[test]
    fn source_names_count_host_collisions() {
        let sources = vec![
            "https://example.com/one.txt".to_string(),
            "https://example.com/two.txt".to_string(),
            "https://other.net/hosts".to_string(),
        ];

        let names: Vec<String> = source_file_names(&sources)
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        assert_eq!(
            names,
            vec!["example.com.1.list", "example.com.2.list", "other.net.1.list"]
        );
    }

    #[tokio::test]
    async fn perform_update_reads_existing_store_without_downloads() {
        let dir = TempDir::new().unwrap();
        write_list(dir.path(), "local.1.list", "0.0.0.0 cached.example\n");

        let mut config = config_for(&dir);
        config.blocking.blocklist = vec!["manual.example".to_string()];

        let store = perform_update(&config, false).await.unwrap();
        assert!(store.exists("cached.example"));
        assert!(store.exists("manual.example"));
    }

    #[tokio::test]
    async fn perform_update_walks_extra_source_dirs() {
        let sources = TempDir::new().unwrap();
        let extra = TempDir::new().unwrap();
        write_list(extra.path(), "corp.list", "0.0.0.0 corp.example\n");

        let mut config = config_for(&sources);
        config
            .blocking
            .source_dirs
            .push(extra.path().to_str().unwrap().to_string());

        let store = perform_update(&config, false).await.unwrap();
        assert!(store.exists("corp.example"));
    }

    #[tokio::test]
    async fn perform_update_creates_sources_store() {
        let parent = TempDir::new().unwrap();
        let sub = parent.path().join("sources");

        let mut config = Config::default();
        config.blocking.sources = Vec::new();
        config.blocking.sources_store = sub.to_str().unwrap().to_string();
        config.blocking.source_dirs = Vec::new();

        perform_update(&config, true).await.unwrap();
        assert!(sub.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&sub).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
