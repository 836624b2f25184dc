//! Discovery of bind-mounted host directories used by guest containers.

use hostlink_core::actions::GuestActions;
use hostlink_core::config::ContainerRuntime;
use hostlink_core::error::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct Mount {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Source", default)]
    source: String,
}

/// Reduce a set of directories to the topmost ones: drop any path that
/// lies inside another path of the set. The result is sorted.
pub fn omit_children_directories(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut sorted = paths.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut kept: Vec<PathBuf> = Vec::new();
    for path in sorted {
        // Component-wise ordering puts a parent directly before its subtree.
        if kept.last().is_some_and(|parent| path.starts_with(parent)) {
            continue;
        }
        kept.push(path);
    }
    kept
}

/// Bind-mount sources from `inspect --format '{{json .Mounts}}'` output,
/// one JSON array per line.
pub fn parse_bind_sources(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<Vec<Mount>>(line) {
            Ok(mounts) => Some(mounts),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparsable mount list");
                None
            }
        })
        .flatten()
        .filter(|m| m.kind == "bind" && !m.source.is_empty())
        .map(|m| PathBuf::from(m.source))
        .collect()
}

fn under_any(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

/// Host directories bind-mounted into running containers that live under
/// one of the mount roots, reduced to their topmost members.
pub async fn discover(
    guest: &dyn GuestActions,
    runtime: ContainerRuntime,
    roots: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    let cli = runtime.cli();
    let ids = guest.run_output(&[cli, "ps", "-q"]).await?;
    let ids: Vec<&str> = ids.split_whitespace().collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut args = vec![cli, "inspect", "--format", "{{json .Mounts}}"];
    args.extend(ids.iter().copied());
    let output = guest.run_output(&args).await?;

    let sources: Vec<PathBuf> = parse_bind_sources(&output)
        .into_iter()
        .filter(|p| under_any(p, roots))
        .collect();
    Ok(omit_children_directories(&sources))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hostlink_core::actions::FileInfo;
    use hostlink_core::error::HostlinkError;

    fn paths(list: &[&str]) -> Vec<PathBuf> {
        list.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_root_covers_everything() {
        assert_eq!(
            omit_children_directories(&paths(&["/", "/user", "/user/someone", "/a", "/a/ee"])),
            paths(&["/"])
        );
    }

    #[test]
    fn test_siblings_kept() {
        assert_eq!(
            omit_children_directories(&paths(&["/someone", "/user", "/user/someone"])),
            paths(&["/someone", "/user"])
        );
    }

    #[test]
    fn test_prefix_without_separator_is_not_parent() {
        assert_eq!(
            omit_children_directories(&paths(&["/user", "/username", "/user/x"])),
            paths(&["/user", "/username"])
        );
    }

    #[test]
    fn test_idempotent() {
        let once = omit_children_directories(&paths(&["/b/c", "/a", "/b", "/a/x/y", "/c"]));
        assert_eq!(omit_children_directories(&once), once);
        assert_eq!(once, paths(&["/a", "/b", "/c"]));
    }

    #[test]
    fn test_parse_bind_sources() {
        let output = r#"[{"Type":"bind","Source":"/Users/me/src","Destination":"/app"},{"Type":"volume","Source":"/var/lib/docker/volumes/x","Destination":"/data"}]
[{"Type":"bind","Source":"/Users/me/other","Destination":"/o"}]
not json
"#;
        assert_eq!(
            parse_bind_sources(output),
            paths(&["/Users/me/src", "/Users/me/other"])
        );
    }

    struct FakeGuest;

    #[async_trait]
    impl GuestActions for FakeGuest {
        async fn run(&self, _args: &[&str]) -> Result<()> {
            Ok(())
        }
        async fn run_quiet(&self, _args: &[&str]) -> Result<()> {
            Ok(())
        }
        async fn run_output(&self, args: &[&str]) -> Result<String> {
            match args.get(1) {
                Some(&"ps") => Ok("abc\ndef".to_string()),
                Some(&"inspect") => {
                    assert_eq!(&args[4..], &["abc", "def"]);
                    Ok(concat!(
                        r#"[{"Type":"bind","Source":"/Users/me/src/app"},{"Type":"bind","Source":"/etc/hosts"}]"#,
                        "\n",
                        r#"[{"Type":"bind","Source":"/Users/me/src"}]"#
                    )
                    .to_string())
                }
                _ => Err(HostlinkError::Other("unexpected".to_string())),
            }
        }
        async fn run_interactive(&self, _args: &[&str]) -> Result<()> {
            Ok(())
        }
        async fn write(&self, _path: &Path, _contents: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn stat(&self, _path: &Path) -> Result<FileInfo> {
            Err(HostlinkError::Other("unsupported".to_string()))
        }
    }

    #[tokio::test]
    async fn test_discover_filters_by_root() {
        let found = discover(&FakeGuest, ContainerRuntime::Docker, &paths(&["/Users"]))
            .await
            .unwrap();
        assert_eq!(found, paths(&["/Users/me/src"]));
    }
}
