//! Local access entities (users, roles, quotas, ...) stored as `<id>.sql` files.

use tracing::{debug, info};

use crate::clickhouse::DatabaseControl;
use crate::metadata::BackupMetadata;
use crate::storage::BackupLayout;
use crate::utils::errors::Result;

/// Marker telling the server to rebuild its entity lists from the files
const REBUILD_MARK_FILE: &str = "need_rebuild_lists.mark";

pub(super) async fn backup_access_control(
    ch_ctl: &dyn DatabaseControl,
    layout: &BackupLayout,
    meta: &mut BackupMetadata,
) -> Result<()> {
    let ids = ch_ctl.list_access_control_objects().await?;
    let local_dir = ch_ctl.access_control_path();
    for id in &ids {
        layout
            .upload_access_control_file(&meta.path, &local_dir, id)
            .await?;
    }
    info!("Backed up {} access entities", ids.len());
    meta.access_control = ids;
    Ok(())
}

pub(super) async fn restore_access_control(
    ch_ctl: &dyn DatabaseControl,
    layout: &BackupLayout,
    meta: &BackupMetadata,
) -> Result<()> {
    if meta.access_control.is_empty() {
        debug!("No access entities to restore");
        return Ok(());
    }

    let local_dir = ch_ctl.access_control_path();
    tokio::fs::create_dir_all(&local_dir).await?;
    for id in &meta.access_control {
        layout
            .download_access_control_file(&meta.path, &local_dir, id)
            .await?;
    }

    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(local_dir.join(REBUILD_MARK_FILE))
        .await?;

    info!("Restored {} access entities", meta.access_control.len());
    Ok(())
}
