use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use arboard::Clipboard;
use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::input::{ClipboardStore, InputError, bounded};

/// X11 reads wait on the selection owner, which may never answer.
const CLIPBOARD_TIMEOUT: Duration = Duration::from_secs(2);

type Reply<T> = oneshot::Sender<Result<T, InputError>>;

enum ClipboardRequest {
    Read(Reply<String>),
    Write(String, Reply<()>),
}

/// System clipboard backed by a single `arboard` handle that lives on its own
/// thread for the life of the process.
#[derive(Clone)]
pub struct ArboardClipboard {
    requests: mpsc::Sender<ClipboardRequest>,
}

impl ArboardClipboard {
    pub fn spawn() -> Result<Self, InputError> {
        let (requests, inbox) = mpsc::channel::<ClipboardRequest>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), InputError>>();

        thread::Builder::new()
            .name("gengo-clipboard".to_string())
            .spawn(move || {
                let mut clipboard = match Clipboard::new() {
                    Ok(clipboard) => {
                        let _ = ready_tx.send(Ok(()));
                        clipboard
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(InputError::Initialization(err.to_string())));
                        return;
                    }
                };

                while let Ok(request) = inbox.recv() {
                    match request {
                        ClipboardRequest::Read(reply) => {
                            let _ = reply.send(read_with(&mut clipboard));
                        }
                        ClipboardRequest::Write(text, reply) => {
                            let result = clipboard
                                .set_text(text)
                                .map_err(|err| InputError::Clipboard(err.to_string()));
                            let _ = reply.send(result);
                        }
                    }
                }
                debug!("clipboard worker stopped");
            })
            .map_err(|err| InputError::Initialization(err.to_string()))?;

        ready_rx
            .recv()
            .map_err(|err| InputError::Initialization(err.to_string()))??;
        info!("clipboard worker started");

        Ok(Self { requests })
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> ClipboardRequest) -> Result<T, InputError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(build(reply_tx))
            .map_err(|_| InputError::Worker("clipboard worker is gone".to_string()))?;
        bounded("clipboard access", CLIPBOARD_TIMEOUT, async {
            reply_rx
                .await
                .map_err(|_| InputError::Worker("clipboard worker dropped the request".to_string()))?
        })
        .await
    }
}

fn read_with(clipboard: &mut Clipboard) -> Result<String, InputError> {
    match clipboard.get_text() {
        Ok(text) => Ok(text),
        Err(arboard::Error::ContentNotAvailable) => Ok(String::new()),
        Err(err) => {
            warn!("clipboard read failed: {err}");
            Err(InputError::Clipboard(err.to_string()))
        }
    }
}

#[async_trait]
impl ClipboardStore for ArboardClipboard {
    async fn read_text(&self) -> Result<String, InputError> {
        self.request(ClipboardRequest::Read).await
    }

    async fn write_text(&self, text: &str) -> Result<(), InputError> {
        let text = text.to_string();
        self.request(move |reply| ClipboardRequest::Write(text, reply)).await
    }
}
