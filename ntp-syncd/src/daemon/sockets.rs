use std::fs::Permissions;
use std::io::{Error, ErrorKind};
use std::path::Path;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixDatagram, UnixListener};

pub async fn write_json<T>(stream: &mut (impl AsyncWrite + Unpin), value: &T) -> std::io::Result<()>
where
    T: serde::Serialize,
{
    let bytes = serde_json::to_vec(value).map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
    stream.write_u64(bytes.len() as u64).await?;
    stream.write_all(&bytes).await
}

fn other_error<T>(msg: String) -> std::io::Result<T> {
    Err(Error::new(ErrorKind::Other, msg))
}

pub fn create_unix_socket_with_permissions(
    path: &Path,
    permissions: Permissions,
) -> std::io::Result<UnixListener> {
    prepare_socket_path(path)?;
    let listener = UnixListener::bind(path).or_else(|e| explain_bind_error(path, e))?;

    std::fs::set_permissions(path, permissions)?;

    Ok(listener)
}

/// Bind the socket a sample source receives its measurements on.
pub fn create_unix_datagram_with_permissions(
    path: &Path,
    permissions: Permissions,
) -> std::io::Result<UnixDatagram> {
    prepare_socket_path(path)?;
    let socket = UnixDatagram::bind(path).or_else(|e| explain_bind_error(path, e))?;

    std::fs::set_permissions(path, permissions)?;

    Ok(socket)
}

// must unlink path before binding (otherwise we get "address already in use")
fn prepare_socket_path(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        use std::os::unix::fs::FileTypeExt;

        let meta = std::fs::metadata(path)?;
        if !meta.file_type().is_socket() {
            return other_error(format!("path {path:?} exists but is not a socket"));
        }

        std::fs::remove_file(path)?;
    }

    Ok(())
}

// OS errors are terrible; let's try to do better
fn explain_bind_error<T>(path: &Path, error: Error) -> std::io::Result<T> {
    // we don't create parent directories
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            let msg = format!(
                r"Could not create socket at {:?} because its parent directory does not exist",
                &path
            );
            return other_error(msg);
        }
    }

    // otherwise, just forward the OS error
    let msg = format!("Could not create socket at {:?}: {:?}", &path, error);

    other_error(msg)
}
