//! Snapshot publication
//!
//! A committed backup becomes the client's visible snapshot by swapping the
//! `current` (or `continuous`) symlink in the client's folder. Default-group
//! backups additionally maintain the global `clients/<client>` symlink and,
//! when configured, per-user symlink views derived from the agent's token
//! file. Publication failures are logged; the backup itself is already
//! sealed at this point.

use crate::list::fix_for_os;
use crate::settings::{ServerSettings, GROUP_CONTINUOUS, GROUP_DEFAULT};
use crate::store::write_atomic;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Name of the token file staged into the hashes tree
pub const TOKENS_LOCAL_NAME: &str = ".tokens";

/// Replace `link` so it points at `target`
async fn replace_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    match tokio::fs::symlink_metadata(link).await {
        Ok(_) => tokio::fs::remove_file(link).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::symlink(target, link).await
}

/// Point the client's snapshot symlinks at `backup_path`
pub async fn publish_backup(
    settings: &ServerSettings,
    client_name: &str,
    group: i32,
    backup_path: &Path,
    hashes_path: &Path,
) {
    let name = if group == GROUP_CONTINUOUS {
        "continuous"
    } else {
        "current"
    };
    let client_dir = settings.backupfolder.join(client_name);
    let current = client_dir.join(name);
    if let Err(e) = replace_symlink(backup_path, &current).await {
        error!(
            "Creating symlink \"{}\" to \"{}\" failed: {e}",
            current.display(),
            backup_path.display()
        );
        return;
    }

    if group != GROUP_DEFAULT {
        return;
    }

    let clients_dir = settings.backupfolder.join("clients");
    if let Err(e) = tokio::fs::create_dir_all(&clients_dir).await {
        error!("Error creating \"clients\" dir for symbolic links: {e}");
    } else {
        let client_link = clients_dir.join(client_name);
        if let Err(e) = replace_symlink(backup_path, &client_link).await {
            error!(
                "Creating symlink \"{}\" failed: {e}",
                client_link.display()
            );
        }
    }

    if settings.create_linked_user_views {
        info!("Creating user views...");
        create_user_views(settings, client_name, backup_path, hashes_path).await;
    }
    save_users_on_client(settings, client_name, hashes_path).await;
}

/// Users named in the agent's token file
async fn read_users(hashes_path: &Path) -> Vec<String> {
    let tokens_file = hashes_path.join(TOKENS_LOCAL_NAME);
    let raw = match tokio::fs::read(&tokens_file).await {
        Ok(raw) => raw,
        Err(e) => {
            debug!("no token file at {}: {e}", tokens_file.display());
            return Vec::new();
        }
    };
    match serde_json::from_slice::<Vec<String>>(&raw) {
        Ok(users) => users,
        Err(e) => {
            warn!("token file is not a user list: {e}");
            Vec::new()
        }
    }
}

/// Build `users/<user>/<client>` symlinks to the new snapshot
async fn create_user_views(
    settings: &ServerSettings,
    client_name: &str,
    backup_path: &Path,
    hashes_path: &Path,
) {
    for user in read_users(hashes_path).await {
        let user_dir = settings.backupfolder.join("users").join(fix_for_os(&user));
        if let Err(e) = tokio::fs::create_dir_all(&user_dir).await {
            warn!("creating user view dir {}: {e}", user_dir.display());
            continue;
        }
        let link = user_dir.join(client_name);
        if let Err(e) = replace_symlink(backup_path, &link).await {
            warn!("creating user view {}: {e}", link.display());
        }
    }
}

/// Persist the user list beside the client's backups
async fn save_users_on_client(settings: &ServerSettings, client_name: &str, hashes_path: &Path) {
    let users = read_users(hashes_path).await;
    if users.is_empty() {
        return;
    }
    let mut contents = String::new();
    for user in &users {
        contents.push_str(user);
        contents.push('\n');
    }
    let path = settings.backupfolder.join(client_name).join("users.txt");
    if let Err(e) = write_atomic(&path, contents.as_bytes()).await {
        warn!("saving user list: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn settings(root: &Path) -> ServerSettings {
        ServerSettings {
            backupfolder: root.to_path_buf(),
            ..Default::default()
        }
    }

    fn make_backup(root: &Path, client: &str, name: &str) -> (PathBuf, PathBuf) {
        let backup = root.join(client).join(name);
        let hashes = root.join(client).join(format!("{name}.hashes"));
        std::fs::create_dir_all(&backup).expect("mkdir");
        std::fs::create_dir_all(&hashes).expect("mkdir");
        (backup, hashes)
    }

    #[tokio::test]
    async fn default_group_updates_current_and_clients() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (backup, hashes) = make_backup(dir.path(), "alpha", "full_1");
        publish_backup(&settings(dir.path()), "alpha", GROUP_DEFAULT, &backup, &hashes).await;

        let current = dir.path().join("alpha/current");
        assert_eq!(std::fs::read_link(&current).expect("current"), backup);
        let client_link = dir.path().join("clients/alpha");
        assert_eq!(std::fs::read_link(&client_link).expect("clients"), backup);
    }

    #[tokio::test]
    async fn symlink_swap_replaces_older_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (old_backup, old_hashes) = make_backup(dir.path(), "alpha", "full_1");
        publish_backup(&settings(dir.path()), "alpha", GROUP_DEFAULT, &old_backup, &old_hashes)
            .await;
        let (new_backup, new_hashes) = make_backup(dir.path(), "alpha", "full_2");
        publish_backup(&settings(dir.path()), "alpha", GROUP_DEFAULT, &new_backup, &new_hashes)
            .await;

        let current = dir.path().join("alpha/current");
        assert_eq!(std::fs::read_link(&current).expect("current"), new_backup);
    }

    #[tokio::test]
    async fn continuous_group_uses_its_own_link() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (backup, hashes) = make_backup(dir.path(), "alpha", "cont_1");
        publish_backup(
            &settings(dir.path()),
            "alpha",
            GROUP_CONTINUOUS,
            &backup,
            &hashes,
        )
        .await;

        assert!(dir.path().join("alpha/continuous").exists());
        assert!(!dir.path().join("clients/alpha").exists());
    }

    #[tokio::test]
    async fn user_views_from_token_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (backup, hashes) = make_backup(dir.path(), "alpha", "full_1");
        std::fs::write(
            hashes.join(TOKENS_LOCAL_NAME),
            serde_json::to_vec(&["alice", "bob"]).expect("json"),
        )
        .expect("tokens");
        let mut s = settings(dir.path());
        s.create_linked_user_views = true;
        publish_backup(&s, "alpha", GROUP_DEFAULT, &backup, &hashes).await;

        assert_eq!(
            std::fs::read_link(dir.path().join("users/alice/alpha")).expect("view"),
            backup
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("alpha/users.txt")).expect("users"),
            "alice\nbob\n"
        );
    }
}
