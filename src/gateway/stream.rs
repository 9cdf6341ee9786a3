//! SSE 透传：把上游事件流逐块原样转发给调用方。

use axum::body::{Body, Bytes};
use axum::http::{StatusCode, header};
use axum::response::Response;
use std::convert::Infallible;

/// 把上游 200 响应的事件流包装成透传响应。
///
/// 中途传输错误不重试（部分输出已经下发），以内联错误事件收尾；
/// 调用方断开连接会让响应流被 drop，上游连接随之立即关闭。
pub fn relay(upstream: reqwest::Response) -> Response {
    let body_stream = async_stream::stream! {
        let mut upstream = upstream;
        loop {
            match upstream.chunk().await {
                Ok(Some(chunk)) => yield Ok::<Bytes, Infallible>(chunk),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("流式透传中断: {e}");
                    yield Ok(error_event(&e.to_string()));
                    break;
                }
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// 内联错误事件：data: {"error":"..."}
pub fn error_event(message: &str) -> Bytes {
    let payload = serde_json::json!({ "error": message });
    Bytes::from(format!("data: {payload}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn error_event_is_a_single_sse_frame() {
        let frame = error_event("Request timeout");
        let text = std::str::from_utf8(&frame).unwrap();
        assert_eq!(text, "data: {\"error\":\"Request timeout\"}\n\n");
    }

    /// 裸 TCP 桩：回一个分块编码的事件后直接断开，不发终止块，
    /// 制造"部分输出已下发后传输中断"的场景。
    async fn spawn_aborting_stub() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = sock.read(&mut buf).await;

            let resp = "HTTP/1.1 200 OK\r\n\
                        content-type: text/event-stream\r\n\
                        transfer-encoding: chunked\r\n\
                        \r\n\
                        a\r\ndata: hi\n\n\r\n";
            let _ = sock.write_all(resp.as_bytes()).await;
            let _ = sock.flush().await;
            // drop 掉连接即中断
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn mid_stream_abort_ends_body_with_inline_error_event() {
        let base = spawn_aborting_stub().await;
        let upstream = reqwest::Client::new()
            .get(&base)
            .send()
            .await
            .unwrap();

        let resp = relay(upstream);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = std::str::from_utf8(&body).unwrap();

        // 已下发的块原样保留，随后以内联错误事件收尾。
        assert!(text.starts_with("data: hi\n\n"));
        let tail = &text["data: hi\n\n".len()..];
        assert!(tail.starts_with("data: {\"error\":"));
        assert!(tail.ends_with("\n\n"));
    }
}
