use echo_service::EchoService;
use echo_service::pb::{EchoRequest, EchoResponse};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request, Response, Status, Streaming};

#[derive(Clone, Default)]
pub struct EchoServiceImpl {
    notifications: Option<mpsc::UnboundedSender<String>>,
}

#[allow(dead_code)]
impl EchoServiceImpl {
    /// An echo service forwarding every `Notify` message to `notifications`.
    pub fn with_notifications(notifications: mpsc::UnboundedSender<String>) -> Self {
        Self {
            notifications: Some(notifications),
        }
    }
}

#[tonic::async_trait]
impl EchoService for EchoServiceImpl {
    type ServerStreamingEchoStream = ReceiverStream<Result<EchoResponse, Status>>;
    type BidirectionalEchoStream = ReceiverStream<Result<EchoResponse, Status>>;

    async fn unary_echo(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<EchoResponse>, Status> {
        Ok(Response::new(EchoResponse {
            message: request.into_inner().message,
        }))
    }

    async fn server_streaming_echo(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<Self::ServerStreamingEchoStream>, Status> {
        let message = request.into_inner().message;
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            for i in 0..3 {
                let reply = EchoResponse {
                    message: format!("{message} - seq {i}"),
                };
                if tx.send(Ok(reply)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn client_streaming_echo(
        &self,
        request: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<EchoResponse>, Status> {
        let mut stream = request.into_inner();
        let mut messages = Vec::new();

        while let Some(item) = stream.next().await {
            messages.push(item?.message);
        }

        Ok(Response::new(EchoResponse {
            message: messages.join(""),
        }))
    }

    async fn bidirectional_echo(
        &self,
        request: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<Self::BidirectionalEchoStream>, Status> {
        let mut stream = request.into_inner();
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let reply = item.map(|req| EchoResponse {
                    message: format!("echo: {}", req.message),
                });
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn notify(&self, request: Request<EchoRequest>) -> Result<Response<()>, Status> {
        if let Some(notifications) = &self.notifications {
            let _ = notifications.send(request.into_inner().message);
        }
        Ok(Response::new(()))
    }

    async fn fail(&self, request: Request<EchoRequest>) -> Result<Response<EchoResponse>, Status> {
        let message = request.into_inner().message;
        let code = message.parse::<i32>().map(Code::from).unwrap_or(Code::Internal);
        Err(Status::new(code, format!("failing on request: {message}")))
    }
}
