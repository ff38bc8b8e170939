//! Dispatch scenarios against in-process backends.
//!
//! A recording sink stands in for the SSH channel; requests go through the
//! same `Server` → `Connection` → action path the transport uses.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sftpfs_kernel::vfs::UnsupportedFileSystem;
use sftpfs_kernel::{
    Attributes, AuthRequest, ClientSession, Credentials, DirEntry, FileSystem, Handle,
    LocalBackend, MemoryBackend, OpenFlags, StatusCode, VfsResult,
};
use sftpfs_server::{AuthDecision, Connection, HandleScope, Request, ResponseSink, Server};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
enum Recorded {
    Status(u32, StatusCode, String),
    Handle(u32, Vec<u8>),
    Data(u32, Vec<u8>),
    Attrs(u32, Attributes),
    Name(u32, Vec<DirEntry>),
}

/// Records every reply; reports saturation while `full` is set.
#[derive(Default)]
struct RecordingSink {
    replies: Mutex<Vec<Recorded>>,
    full: AtomicBool,
}

impl RecordingSink {
    fn record(&self, reply: Recorded) -> bool {
        self.replies.lock().push(reply);
        !self.full.load(Ordering::SeqCst)
    }

    fn last(&self) -> Recorded {
        self.replies.lock().last().cloned().expect("no reply recorded")
    }

    fn len(&self) -> usize {
        self.replies.lock().len()
    }
}

impl ResponseSink for RecordingSink {
    fn status(&self, id: u32, code: StatusCode, message: &str) -> bool {
        self.record(Recorded::Status(id, code, message.to_string()))
    }
    fn handle(&self, id: u32, token: &[u8]) -> bool {
        self.record(Recorded::Handle(id, token.to_vec()))
    }
    fn data(&self, id: u32, data: &[u8]) -> bool {
        self.record(Recorded::Data(id, data.to_vec()))
    }
    fn attrs(&self, id: u32, attrs: &Attributes) -> bool {
        self.record(Recorded::Attrs(id, attrs.clone()))
    }
    fn name(&self, id: u32, entries: &[DirEntry]) -> bool {
        self.record(Recorded::Name(id, entries.to_vec()))
    }
}

struct Client {
    server: Arc<Server>,
    conn: Arc<Connection>,
    sink: Arc<RecordingSink>,
    next_id: u32,
}

impl Client {
    fn new(fs: Arc<dyn FileSystem>) -> Self {
        let server = Arc::new(Server::new(fs, HandleScope::Shared));
        let conn = server.create_connection(ClientSession::new("amy", None));
        let sink = Arc::new(RecordingSink::default());
        conn.attach_stream(sink.clone());
        Self {
            server,
            conn,
            sink,
            next_id: 1,
        }
    }

    fn id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn send(&self, request: Request) -> Recorded {
        self.conn.clone().dispatch(request).await;
        self.sink.last()
    }

    async fn expect_status(&self, request: Request, code: StatusCode) {
        match self.send(request).await {
            Recorded::Status(_, got, message) => assert_eq!(got, code, "{message}"),
            other => panic!("expected status {code:?}, got {other:?}"),
        }
    }

    async fn open(&mut self, path: &str, flags: OpenFlags) -> Vec<u8> {
        let id = self.id();
        let request = Request::Open {
            id,
            path: path.into(),
            flags,
            attrs: Attributes::new(),
        };
        match self.send(request).await {
            Recorded::Handle(reply_id, token) => {
                assert_eq!(reply_id, id);
                token
            }
            other => panic!("open failed: {other:?}"),
        }
    }

    async fn opendir(&mut self, path: &str) -> Vec<u8> {
        let id = self.id();
        match self.send(Request::Opendir { id, path: path.into() }).await {
            Recorded::Handle(_, token) => token,
            other => panic!("opendir failed: {other:?}"),
        }
    }

    async fn close(&mut self, handle: Vec<u8>) {
        let id = self.id();
        self.expect_status(Request::Close { id, handle }, StatusCode::Ok)
            .await;
    }

    async fn list(&mut self, path: &str) -> Vec<String> {
        let handle = self.opendir(path).await;
        let id = self.id();
        let names = match self
            .send(Request::Readdir {
                id,
                handle: handle.clone(),
            })
            .await
        {
            Recorded::Name(_, entries) => entries.into_iter().map(|e| e.filename).collect(),
            other => panic!("readdir failed: {other:?}"),
        };
        self.close(handle).await;
        names
    }
}

#[tokio::test]
async fn test_file_round_trip() {
    let mut client = Client::new(Arc::new(MemoryBackend::new()));

    let handle = client.open("/f", OpenFlags::create_write()).await;
    let id = client.id();
    client
        .expect_status(
            Request::Write {
                id,
                handle: handle.clone(),
                offset: 0,
                data: b"Hello World".to_vec(),
            },
            StatusCode::Ok,
        )
        .await;
    client.close(handle).await;

    let handle = client.open("/f", OpenFlags::read_only()).await;
    let id = client.id();
    let reply = client
        .send(Request::Read {
            id,
            handle: handle.clone(),
            offset: 0,
            len: 11,
        })
        .await;
    assert_eq!(reply, Recorded::Data(id, b"Hello World".to_vec()));

    // At the end of the file: EOF, not an empty DATA.
    let id = client.id();
    client
        .expect_status(
            Request::Read {
                id,
                handle: handle.clone(),
                offset: 11,
                len: 11,
            },
            StatusCode::Eof,
        )
        .await;
    client.close(handle).await;
    assert_eq!(client.conn.handle_count(), 0);
}

#[tokio::test]
async fn test_directory_rename_visibility() {
    let mut client = Client::new(Arc::new(MemoryBackend::new()));

    let id = client.id();
    client
        .expect_status(
            Request::Mkdir {
                id,
                path: "/a".into(),
                attrs: Attributes::new(),
            },
            StatusCode::Ok,
        )
        .await;
    assert_eq!(client.list("/").await, vec!["a"]);

    let id = client.id();
    client
        .expect_status(
            Request::Rename {
                id,
                old_path: "/a".into(),
                new_path: "/b".into(),
            },
            StatusCode::Ok,
        )
        .await;
    assert_eq!(client.list("/").await, vec!["b"]);
}

#[tokio::test]
async fn test_directory_listing_is_single_shot() {
    let mut client = Client::new(Arc::new(MemoryBackend::new()));
    for name in ["/x", "/y"] {
        let handle = client.open(name, OpenFlags::create_write()).await;
        client.close(handle).await;
    }

    let handle = client.opendir("/").await;
    let id = client.id();
    match client.send(Request::Readdir { id, handle: handle.clone() }).await {
        Recorded::Name(_, entries) => assert_eq!(entries.len(), 2),
        other => panic!("readdir failed: {other:?}"),
    }
    let id = client.id();
    client
        .expect_status(Request::Readdir { id, handle }, StatusCode::Eof)
        .await;
}

#[tokio::test]
async fn test_authentication_rejection() {
    let fs = MemoryBackend::new().with_credentials(Credentials::new("amy", "secret"));
    let server = Server::new(Arc::new(fs), HandleScope::Shared);
    let session = ClientSession::anonymous(None);

    let err = server
        .authenticate(&session, &AuthRequest::password("x", "wrong"))
        .await;
    assert_eq!(err, AuthDecision::Reject);
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_unsupported_backend_operation() {
    let mut client = Client::new(Arc::new(UnsupportedFileSystem));
    let id = client.id();
    client
        .expect_status(
            Request::Symlink {
                id,
                target_path: "/t".into(),
                link_path: "/l".into(),
            },
            StatusCode::OpUnsupported,
        )
        .await;

    // A failing open leaves nothing behind.
    let id = client.id();
    client
        .expect_status(
            Request::Open {
                id,
                path: "/f".into(),
                flags: OpenFlags::read_only(),
                attrs: Attributes::new(),
            },
            StatusCode::OpUnsupported,
        )
        .await;
    assert_eq!(client.conn.handle_count(), 0);
    assert_eq!(client.server.allocator().live_count(), 0);
}

#[tokio::test]
async fn test_stale_and_malformed_handles() {
    let mut client = Client::new(Arc::new(MemoryBackend::new()));
    let handle = client.open("/f", OpenFlags::create_write()).await;
    client.close(handle.clone()).await;

    let id = client.id();
    client
        .expect_status(
            Request::Read {
                id,
                handle,
                offset: 0,
                len: 4,
            },
            StatusCode::Failure,
        )
        .await;

    let id = client.id();
    client
        .expect_status(Request::Close { id, handle: vec![1, 2, 3] }, StatusCode::BadMessage)
        .await;
}

#[tokio::test]
async fn test_realpath_and_stat_replies() {
    let mut client = Client::new(Arc::new(MemoryBackend::new()));
    let handle = client.open("/docs.txt", OpenFlags::create_write()).await;

    let id = client.id();
    match client.send(Request::Realpath { id, path: "/a/../docs.txt".into() }).await {
        Recorded::Name(reply_id, entries) => {
            assert_eq!(reply_id, id);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].filename, "/docs.txt");
        }
        other => panic!("realpath failed: {other:?}"),
    }

    let id = client.id();
    match client.send(Request::Fstat { id, handle }).await {
        Recorded::Attrs(_, attrs) => {
            assert_eq!(attrs.size, Some(0));
            assert!(attrs.permissions().is_some());
        }
        other => panic!("fstat failed: {other:?}"),
    }
}

#[tokio::test]
async fn test_teardown_releases_open_handles() {
    let fs = Arc::new(MemoryBackend::new());
    let mut client = Client::new(fs.clone());
    let _a = client.open("/a", OpenFlags::create_write()).await;
    let _b = client.open("/b", OpenFlags::create_write()).await;
    assert_eq!(fs.open_handles(), 2);

    let mut events = client.server.subscribe();
    client.server.destroy_connection(client.conn.id()).await;

    assert_eq!(fs.open_handles(), 0);
    assert_eq!(client.conn.handle_count(), 0);
    assert!(client.conn.is_closed());
    assert_eq!(client.server.allocator().live_count(), 0);
    assert!(matches!(
        events.recv().await.unwrap(),
        sftpfs_server::ServerEvent::ClientDisconnected { .. }
    ));
}

#[tokio::test]
async fn test_saturated_sink_holds_replies_until_continue() {
    let mut client = Client::new(Arc::new(MemoryBackend::new()));
    client.sink.full.store(true, Ordering::SeqCst);

    // This reply goes out and closes the gate.
    let id = client.id();
    client
        .expect_status(
            Request::Mkdir {
                id,
                path: "/a".into(),
                attrs: Attributes::new(),
            },
            StatusCode::Ok,
        )
        .await;
    assert!(client.conn.is_paused());
    client.sink.full.store(false, Ordering::SeqCst);

    let finished = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for path in ["/b", "/c"] {
        let id = client.id();
        let conn = client.conn.clone();
        let finished = finished.clone();
        tasks.push(tokio::spawn(async move {
            conn.dispatch(Request::Mkdir {
                id,
                path: path.into(),
                attrs: Attributes::new(),
            })
            .await;
            finished.fetch_add(1, Ordering::SeqCst);
        }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.sink.len(), 1);
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    client.server.on_continue(client.conn.id());
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(client.sink.len(), 3);
    assert!(!client.conn.is_paused());
}

#[tokio::test]
async fn test_local_backend_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut client = Client::new(Arc::new(LocalBackend::new(dir.path())));

    let handle = client.open("/notes.txt", OpenFlags::create_truncate()).await;
    let id = client.id();
    client
        .expect_status(
            Request::Write {
                id,
                handle: handle.clone(),
                offset: 0,
                data: b"on disk".to_vec(),
            },
            StatusCode::Ok,
        )
        .await;
    client.close(handle).await;

    assert_eq!(
        std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
        "on disk"
    );
    assert_eq!(client.list("/").await, vec!["notes.txt"]);

    let id = client.id();
    client
        .expect_status(
            Request::Remove {
                id,
                path: "/missing".into(),
            },
            StatusCode::NoSuchFile,
        )
        .await;
}

/// Memory backend whose `open` parks until the test lets it finish.
#[derive(Default)]
struct SlowOpen {
    inner: MemoryBackend,
    entered: Notify,
    proceed: Notify,
}

#[async_trait]
impl FileSystem for SlowOpen {
    async fn open(
        &self,
        session: &ClientSession,
        handle: &Handle,
        flags: OpenFlags,
        attrs: &Attributes,
    ) -> VfsResult<()> {
        self.entered.notify_one();
        self.proceed.notified().await;
        self.inner.open(session, handle, flags, attrs).await
    }
}

#[tokio::test]
async fn test_teardown_during_open_leaves_nothing_behind() {
    let fs = Arc::new(SlowOpen::default());
    let client = Client::new(fs.clone());

    let pending = tokio::spawn(client.conn.clone().dispatch(Request::Open {
        id: 1,
        path: "/f".into(),
        flags: OpenFlags::create_write(),
        attrs: Attributes::new(),
    }));
    fs.entered.notified().await;

    client.server.destroy_connection(client.conn.id()).await;
    fs.proceed.notify_one();
    pending.await.unwrap();

    assert_eq!(fs.inner.open_handles(), 0);
    assert_eq!(client.conn.handle_count(), 0);
    assert_eq!(client.server.allocator().live_count(), 0);
    assert!(matches!(
        client.sink.last(),
        Recorded::Status(1, StatusCode::Failure, _)
    ));
}
