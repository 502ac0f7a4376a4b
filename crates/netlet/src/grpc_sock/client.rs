use std::path::{Path, PathBuf};

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Connects a tonic channel to a unix socket. The URI is a placeholder; the
/// connector ignores it and dials the socket path.
pub async fn socket_channel<P: AsRef<Path>>(path: P) -> anyhow::Result<Channel> {
    let path: PathBuf = path.as_ref().to_path_buf();
    let channel = Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                let stream = UnixStream::connect(path).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await?;
    Ok(channel)
}
