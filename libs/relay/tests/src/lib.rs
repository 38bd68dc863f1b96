#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use futures::StreamExt;
    use serde_json::{Value, json};
    use telemetry_relay::axum::AppState;
    use telemetry_relay::{BroadcastConfig, Broadcaster, DeliveryMode};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
    use tokio_util::sync::CancellationToken;

    type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        broadcaster: Arc<Broadcaster>,
        token: CancellationToken,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }

        async fn connect(&self) -> Ws {
            let (ws, _) = connect_async(format!("ws://{}/ws/telemetry", self.addr))
                .await
                .expect("failed to connect websocket");
            ws
        }

        async fn push(&self, body: &Value) -> reqwest::Response {
            reqwest::Client::new()
                .post(self.url("/telemetry"))
                .json(body)
                .send()
                .await
                .expect("push failed")
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.token.cancel();
        }
    }

    async fn setup(mode: DeliveryMode) -> TestServer {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let broadcaster = Arc::new(Broadcaster::new(BroadcastConfig {
            mode,
            interval_ms: 50,
            ..BroadcastConfig::default()
        }));
        let token = CancellationToken::new();
        let state = AppState {
            broadcaster: broadcaster.clone(),
            token: token.clone(),
        };
        tokio::spawn(telemetry_relay::axum::serve(listener, state));
        tokio::spawn(broadcaster.clone().run_periodic(token.clone()));
        TestServer {
            addr,
            broadcaster,
            token,
        }
    }

    fn frame(altitude: f64) -> Value {
        json!({
            "altitude": altitude,
            "pressure": 1000.0,
            "temp_baro": 15.0,
            "accel": {"x": 0, "y": 0, "z": 9.8},
            "gyro": {"x": 0, "y": 0, "z": 0},
            "mag": {"x": 0, "y": 0, "z": 0},
            "temp_imu": 20.0
        })
    }

    async fn next_sample(ws: &mut Ws) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for sample")
                .expect("websocket closed")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).expect("sample is not json");
            }
        }
    }

    async fn wait_for_subscribers(broadcaster: &Broadcaster, count: usize) {
        timeout(Duration::from_secs(5), async {
            while broadcaster.subscribers() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriber count never settled");
    }

    #[tokio::test]
    async fn test_health() {
        let server = setup(DeliveryMode::OnPublish).await;
        let body: Value = reqwest::get(server.url("/"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({"status": "Telemetry relay running"}));
        assert!(server.broadcaster.latest().is_none());
    }

    #[tokio::test]
    async fn test_push_reaches_subscriber() {
        let server = setup(DeliveryMode::OnPublish).await;
        let connected_at = Utc::now();
        let mut ws = server.connect().await;
        wait_for_subscribers(&server.broadcaster, 1).await;

        let res = server.push(&frame(100.0)).await;
        assert_eq!(res.status(), reqwest::StatusCode::OK);
        let ack: Value = res.json().await.unwrap();
        assert_eq!(ack["status"], json!("ok"));

        let sample = next_sample(&mut ws).await;
        assert_eq!(sample["altitude"], json!(100.0));
        assert_eq!(sample["accel"]["z"], json!(9.8));
        let timestamp = DateTime::parse_from_rfc3339(sample["timestamp"].as_str().unwrap())
            .unwrap()
            .with_timezone(&Utc);
        assert!(timestamp > connected_at);
    }

    #[tokio::test]
    async fn test_invalid_push_is_rejected() {
        let server = setup(DeliveryMode::OnPublish).await;

        let mut body = frame(1.0);
        body.as_object_mut().unwrap().remove("mag");
        let res = server.push(&body).await;
        assert_eq!(res.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
        let err: Value = res.json().await.unwrap();
        assert!(err["description"].as_str().unwrap().contains("mag"));

        let res = reqwest::Client::new()
            .post(server.url("/telemetry"))
            .body("altitude=12")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);

        assert!(server.broadcaster.latest().is_none());
        assert_eq!(server.broadcaster.published(), 0);
    }

    #[tokio::test]
    async fn test_publication_order() {
        let server = setup(DeliveryMode::OnPublish).await;
        let mut ws = server.connect().await;
        wait_for_subscribers(&server.broadcaster, 1).await;

        server.push(&frame(1.0)).await;
        server.push(&frame(2.0)).await;
        assert_eq!(next_sample(&mut ws).await["altitude"], json!(1.0));
        assert_eq!(next_sample(&mut ws).await["altitude"], json!(2.0));
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_latest() {
        let server = setup(DeliveryMode::OnPublish).await;
        for i in 0..3 {
            server.push(&frame(i as f64)).await;
        }
        let mut ws = server.connect().await;
        assert_eq!(next_sample(&mut ws).await["altitude"], json!(2.0));
    }

    #[tokio::test]
    async fn test_disconnect_does_not_affect_others() {
        let server = setup(DeliveryMode::Hybrid).await;
        let mut a = server.connect().await;
        let mut b = server.connect().await;
        wait_for_subscribers(&server.broadcaster, 2).await;

        server.push(&frame(5.0)).await;
        assert_eq!(next_sample(&mut a).await["altitude"], json!(5.0));
        assert_eq!(next_sample(&mut b).await["altitude"], json!(5.0));

        let _ = a.close(None).await;
        drop(a);
        for _ in 0..3 {
            assert_eq!(next_sample(&mut b).await["altitude"], json!(5.0));
        }
        wait_for_subscribers(&server.broadcaster, 1).await;

        server.push(&frame(6.0)).await;
        loop {
            if next_sample(&mut b).await["altitude"] == json!(6.0) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_sends_close() {
        let server = setup(DeliveryMode::Hybrid).await;
        let mut ws = server.connect().await;
        server.push(&frame(1.0)).await;
        next_sample(&mut ws).await;

        server.token.cancel();
        let closed = timeout(Duration::from_secs(5), async {
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Close(_)) => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
            false
        })
        .await
        .expect("timed out waiting for close");
        assert!(closed);
        wait_for_subscribers(&server.broadcaster, 0).await;
    }
}
