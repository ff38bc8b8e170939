//! Request actions: the bridge from decoded requests to [`FileSystem`] calls.
//!
//! [`register`] installs one action per request type on a connection. Each
//! action resolves handle tokens, calls the backend, and turns the result
//! into a [`Reply`]; errors fall through to the dispatcher, which reports
//! the error's status code.

use std::future::Future;
use std::sync::Arc;

use sftpfs_kernel::handle::{HandleId, HandleKind};
use sftpfs_kernel::{DirEntry, FileSystem, StatusCode, VfsError, VfsResult};

use crate::connection::{Connection, Reply};
use crate::constants::MAX_READ_LEN;
use crate::protocol::{Request, RequestKind};

/// Install the full request table on `connection`.
pub fn register(connection: &Connection, fs: Arc<dyn FileSystem>) {
    on(connection, RequestKind::Open, &fs, open);
    on(connection, RequestKind::Close, &fs, close);
    on(connection, RequestKind::Read, &fs, read);
    on(connection, RequestKind::Write, &fs, write);
    on(connection, RequestKind::Lstat, &fs, lstat);
    on(connection, RequestKind::Fstat, &fs, fstat);
    on(connection, RequestKind::Setstat, &fs, setstat);
    on(connection, RequestKind::Fsetstat, &fs, fsetstat);
    on(connection, RequestKind::Opendir, &fs, opendir);
    on(connection, RequestKind::Readdir, &fs, readdir);
    on(connection, RequestKind::Remove, &fs, remove);
    on(connection, RequestKind::Mkdir, &fs, mkdir);
    on(connection, RequestKind::Rmdir, &fs, rmdir);
    on(connection, RequestKind::Realpath, &fs, realpath);
    on(connection, RequestKind::Stat, &fs, stat);
    on(connection, RequestKind::Rename, &fs, rename);
    on(connection, RequestKind::Readlink, &fs, readlink);
    on(connection, RequestKind::Symlink, &fs, symlink);
}

fn on<F, Fut>(connection: &Connection, kind: RequestKind, fs: &Arc<dyn FileSystem>, f: F)
where
    F: Fn(Arc<dyn FileSystem>, Arc<Connection>, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = VfsResult<Reply>> + Send + 'static,
{
    let fs = fs.clone();
    connection.add_action(kind, move |conn, req| f(fs.clone(), conn, req));
}

fn mismatch(expected: RequestKind) -> VfsError {
    VfsError::bad_message(format!("{expected} action received another request type"))
}

fn one_name(id: u32, name: String) -> Reply {
    Reply::respond(move |s| s.name(id, &[DirEntry::name_only(name)]))
}

// ============================================================================
// Handles
// ============================================================================

async fn open(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Open { id, path, flags, attrs } = req else {
        return Err(mismatch(RequestKind::Open));
    };

    let handle = conn.create_file_handle(path)?;
    if let Err(e) = fs.open(conn.session(), &handle, flags, &attrs).await {
        conn.discard_handle(&handle).await;
        return Err(e);
    }
    conn.activate_handle(&handle).await?;

    let token = handle.id().encode();
    Ok(Reply::respond(move |s| s.handle(id, &token)))
}

async fn close(_fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Close { handle, .. } = req else {
        return Err(mismatch(RequestKind::Close));
    };

    conn.destroy_handle(HandleId::decode(&handle)?).await?;
    Ok(Reply::Done)
}

async fn read(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Read { id, handle, offset, len } = req else {
        return Err(mismatch(RequestKind::Read));
    };

    let handle = conn.handle(&handle)?;
    if handle.kind() != HandleKind::File {
        return Err(VfsError::is_a_directory(handle.path()));
    }

    match fs
        .read(conn.session(), &handle, offset, len.min(MAX_READ_LEN))
        .await?
    {
        Some(data) => Ok(Reply::respond(move |s| s.data(id, &data))),
        None => Ok(Reply::Status(StatusCode::Eof)),
    }
}

async fn write(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Write { handle, offset, data, .. } = req else {
        return Err(mismatch(RequestKind::Write));
    };

    let handle = conn.handle(&handle)?;
    if handle.kind() != HandleKind::File {
        return Err(VfsError::is_a_directory(handle.path()));
    }

    fs.write(conn.session(), &handle, offset, &data).await?;
    Ok(Reply::Done)
}

async fn opendir(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Opendir { id, path } = req else {
        return Err(mismatch(RequestKind::Opendir));
    };

    let handle = conn.create_directory_handle(path)?;
    if let Err(e) = fs.opendir(conn.session(), &handle).await {
        conn.discard_handle(&handle).await;
        return Err(e);
    }
    conn.activate_handle(&handle).await?;

    let token = handle.id().encode();
    Ok(Reply::respond(move |s| s.handle(id, &token)))
}

async fn readdir(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Readdir { id, handle } = req else {
        return Err(mismatch(RequestKind::Readdir));
    };

    let handle = conn.handle(&handle)?;
    if handle.kind() != HandleKind::Directory {
        return Err(VfsError::not_a_directory(handle.path()));
    }

    match fs.listdir(conn.session(), &handle).await? {
        Some(entries) => Ok(Reply::respond(move |s| s.name(id, &entries))),
        None => Ok(Reply::Status(StatusCode::Eof)),
    }
}

// ============================================================================
// Metadata
// ============================================================================

async fn lstat(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Lstat { id, path } = req else {
        return Err(mismatch(RequestKind::Lstat));
    };

    let attrs = fs.lstat(conn.session(), &path).await?;
    Ok(Reply::respond(move |s| s.attrs(id, &attrs)))
}

async fn stat(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Stat { id, path } = req else {
        return Err(mismatch(RequestKind::Stat));
    };

    let attrs = fs.stat(conn.session(), &path).await?;
    Ok(Reply::respond(move |s| s.attrs(id, &attrs)))
}

async fn fstat(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Fstat { id, handle } = req else {
        return Err(mismatch(RequestKind::Fstat));
    };

    let handle = conn.handle(&handle)?;
    let attrs = fs.stat(conn.session(), handle.path()).await?;
    Ok(Reply::respond(move |s| s.attrs(id, &attrs)))
}

async fn setstat(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Setstat { path, attrs, .. } = req else {
        return Err(mismatch(RequestKind::Setstat));
    };

    fs.setstat(conn.session(), &path, &attrs).await?;
    Ok(Reply::Done)
}

async fn fsetstat(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Fsetstat { handle, attrs, .. } = req else {
        return Err(mismatch(RequestKind::Fsetstat));
    };

    let handle = conn.handle(&handle)?;
    fs.setstat(conn.session(), handle.path(), &attrs).await?;
    Ok(Reply::Done)
}

// ============================================================================
// Namespace
// ============================================================================

async fn remove(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Remove { path, .. } = req else {
        return Err(mismatch(RequestKind::Remove));
    };

    fs.remove(conn.session(), &path).await?;
    Ok(Reply::Done)
}

async fn mkdir(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Mkdir { path, attrs, .. } = req else {
        return Err(mismatch(RequestKind::Mkdir));
    };

    fs.mkdir(conn.session(), &path, &attrs).await?;
    Ok(Reply::Done)
}

async fn rmdir(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Rmdir { path, .. } = req else {
        return Err(mismatch(RequestKind::Rmdir));
    };

    fs.rmdir(conn.session(), &path).await?;
    Ok(Reply::Done)
}

async fn realpath(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Realpath { id, path } = req else {
        return Err(mismatch(RequestKind::Realpath));
    };

    let resolved = fs.realpath(conn.session(), &path).await?;
    Ok(one_name(id, resolved))
}

async fn rename(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Rename { old_path, new_path, .. } = req else {
        return Err(mismatch(RequestKind::Rename));
    };

    fs.rename(conn.session(), &old_path, &new_path).await?;
    Ok(Reply::Done)
}

async fn readlink(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Readlink { id, path } = req else {
        return Err(mismatch(RequestKind::Readlink));
    };

    let target = fs.readlink(conn.session(), &path).await?;
    Ok(one_name(id, target))
}

async fn symlink(fs: Arc<dyn FileSystem>, conn: Arc<Connection>, req: Request) -> VfsResult<Reply> {
    let Request::Symlink { target_path, link_path, .. } = req else {
        return Err(mismatch(RequestKind::Symlink));
    };

    fs.symlink(conn.session(), &target_path, &link_path).await?;
    Ok(Reply::Done)
}
