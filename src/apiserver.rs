// apiserver.rs

use askama::Template;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Response, StatusCode},
    response::{Html, IntoResponse},
    routing::*,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::{sync::Mutex, task::JoinHandle};
use tower_http::trace::TraceLayer;

use crate::*;

const HDR_CONNECT_SSID: &str = "my-connect-ssid";
const HDR_CONNECT_PWD: &str = "my-connect-pwd";

/// Anything the coordinator can bring up on `StartHttpServer`.
pub trait ControlSurface: Send {
    /// Returns true if this call started it.
    fn start(&mut self) -> bool;
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

/// HTTP server plus its monitor task.
pub struct HttpServer {
    state: SharedState,
    monitor_rx: Arc<Mutex<MsgReceiver<HttpMsg>>>,
    restart: Arc<RestartTimer>,
    tasks: Option<(JoinHandle<()>, JoinHandle<()>)>,
}

impl HttpServer {
    pub fn new(
        state: SharedState,
        monitor_rx: MsgReceiver<HttpMsg>,
        restarter: Arc<dyn Restarter>,
    ) -> Self {
        let restart = Arc::new(RestartTimer::new(state.config.restart_delay(), restarter));
        Self {
            state,
            monitor_rx: Arc::new(Mutex::new(monitor_rx)),
            restart,
            tasks: None,
        }
    }
}

impl ControlSurface for HttpServer {
    fn start(&mut self) -> bool {
        if self.is_running() {
            return false;
        }

        let monitor = HttpMonitor::new(
            self.state.clone(),
            self.monitor_rx.clone(),
            self.restart.clone(),
        );
        let monitor = tokio::spawn(async move {
            if let Err(e) = monitor.run().await {
                error!("http_server_monitor ended: {e:#}");
            }
        });

        let state = self.state.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = Box::pin(run_api_server(state)).await {
                error!("run_api_server() ended: {e:#}");
            }
        });

        self.tasks = Some((server, monitor));
        true
    }

    fn stop(&mut self) {
        if let Some((server, monitor)) = self.tasks.take() {
            info!("Stopping http server");
            server.abort();
            info!("Stopping http server monitor");
            monitor.abort();
        }
    }

    fn is_running(&self) -> bool {
        self.tasks
            .as_ref()
            .is_some_and(|(server, monitor)| !server.is_finished() && !monitor.is_finished())
    }
}

pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(get_index))
        .route("/app.css", get(get_app_css))
        .route("/app.js", get(get_app_js))
        .route("/favicon.ico", get(get_favicon))
        .route("/OTAupdate", post(update_fw))
        .route("/OTAstatus", post(ota_status))
        .route("/dhtSensor.json", get(get_sensor))
        .route("/wifiConnect.json", post(wifi_connect))
        .route("/wifiConnectStatus", post(wifi_connect_status))
        .route("/wifiConnectInfo.json", get(wifi_connect_info))
        .route("/wifiDisconnect.json", delete(wifi_disconnect))
        .route("/localTime.json", get(get_local_time))
        .route("/apSSID.json", get(get_ap_ssid))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(state: SharedState) -> anyhow::Result<()> {
    let listen = format!("0.0.0.0:{}", state.config.api_port);
    let addr = listen.parse::<SocketAddr>()?;

    let app = api_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening to {listen}");
    Ok(axum::serve(listener, app.into_make_service()).await?)
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate<'a> {
    ap_ssid: &'a str,
    fw_version: &'a str,
}

pub async fn get_index(State(state): State<SharedState>) -> Response<Body> {
    let cnt = state.next_api_cnt();
    info!("#{cnt} get_index()");

    let index = IndexTemplate {
        ap_ssid: &state.config.ap_ssid,
        fw_version: FW_VERSION,
    };
    match index.render() {
        Err(e) => {
            let err_msg = format!("Index template error: {e:?}\n");
            error!("{err_msg}");
            (StatusCode::INTERNAL_SERVER_ERROR, err_msg).into_response()
        }
        Ok(s) => (StatusCode::OK, Html(s)).into_response(),
    }
}

pub async fn get_app_css(State(state): State<SharedState>) -> Response<Body> {
    let cnt = state.next_api_cnt();
    info!("#{cnt} get_app_css()");

    let css = include_str!("app.css");
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/css")], css).into_response()
}

pub async fn get_app_js(State(state): State<SharedState>) -> Response<Body> {
    let cnt = state.next_api_cnt();
    info!("#{cnt} get_app_js()");

    let js = include_str!("app.js");
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/javascript")],
        js,
    )
        .into_response()
}

pub async fn get_favicon(State(state): State<SharedState>) -> Response<Body> {
    let cnt = state.next_api_cnt();
    info!("#{cnt} get_favicon()");

    let favicon = include_bytes!("favicon.ico");
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/x-icon")],
        favicon.to_vec(),
    )
        .into_response()
}

async fn update_fw(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Body,
) -> Response<Body> {
    let cnt = state.next_api_cnt();
    info!("#{cnt} update_fw()");

    if state.ota_update_status() == OtaUpdateStatus::Successful {
        warn!("Firmware already updated, ignoring upload until restart");
        return StatusCode::OK.into_response();
    }

    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    let res = {
        let mut slot = state.firmware.lock().await;
        if slot.committed {
            warn!("Firmware committed while this upload waited, ignoring it");
            return StatusCode::OK.into_response();
        }
        let res = receive_firmware(
            slot.sink.as_mut(),
            body.into_data_stream(),
            declared_len,
            &state.config,
        )
        .await;
        if matches!(res, Ok(OtaOutcome::Flashed)) {
            slot.committed = true;
        }
        res
    };

    let (msg, code) = match res {
        Ok(OtaOutcome::Flashed) => (HttpMsg::OtaUpdateSuccessful, StatusCode::OK),
        Ok(OtaOutcome::Failed) => (HttpMsg::OtaUpdateFailed, StatusCode::OK),
        Err(e) => {
            error!("{e:#}");
            (HttpMsg::OtaUpdateFailed, StatusCode::INTERNAL_SERVER_ERROR)
        }
    };
    if let Err(e) = state.bus.http.send(msg).await {
        error!("{e:#}");
    }
    code.into_response()
}

#[derive(Serialize)]
struct OtaStatusJson {
    ota_update_status: i8,
    compile_time: &'static str,
    compile_date: &'static str,
}

async fn ota_status(State(state): State<SharedState>) -> Json<OtaStatusJson> {
    let cnt = state.next_api_cnt();
    info!("#{cnt} ota_status()");

    Json(OtaStatusJson {
        ota_update_status: state.ota_update_status().code(),
        compile_time: COMPILE_TIME,
        compile_date: COMPILE_DATE,
    })
}

#[derive(Serialize)]
struct SensorJson {
    status: &'static str,
    temp: i32,
    humidity: i32,
}

async fn get_sensor(State(state): State<SharedState>) -> Json<SensorJson> {
    let cnt = state.next_api_cnt();
    info!("#{cnt} get_sensor()");

    let r = *state.sensor.read().await;
    Json(SensorJson {
        status: r.status.as_str(),
        temp: r.temperature,
        humidity: r.humidity,
    })
}

/// Header value as text. Browsers send non-ASCII as raw bytes, which are
/// taken as UTF-8 when valid and as ISO-8859-1 otherwise.
fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(name)?.as_bytes();
    if raw.is_empty() {
        return None;
    }
    Some(match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => raw.iter().map(|&b| char::from(b)).collect(),
    })
}

async fn wifi_connect(State(state): State<SharedState>, headers: HeaderMap) -> StatusCode {
    let cnt = state.next_api_cnt();
    info!("#{cnt} wifi_connect()");

    let ssid = header_text(&headers, HDR_CONNECT_SSID);
    let pwd = header_text(&headers, HDR_CONNECT_PWD);
    if let Some(s) = &ssid {
        info!("Found header => {HDR_CONNECT_SSID}: {s}");
    }
    if pwd.is_some() {
        info!("Found header => {HDR_CONNECT_PWD}");
    }

    // the write must be complete before the connect message is posted
    state
        .sta_config
        .write()
        .await
        .overwrite(ssid.as_deref(), pwd.as_deref());

    if let Err(e) = state.bus.wifi.send(WifiMsg::ConnectingFromHttpServer).await {
        error!("{e:#}");
    }
    StatusCode::OK
}

async fn wifi_connect_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let cnt = state.next_api_cnt();
    info!("#{cnt} wifi_connect_status()");

    Json(json!({ "wifi_connect_status": state.wifi_connect_status().code() }))
}

async fn wifi_connect_info(State(state): State<SharedState>) -> Response<Body> {
    let cnt = state.next_api_cnt();
    info!("#{cnt} wifi_connect_info()");

    if state.wifi_connect_status() != WifiConnectStatus::ConnectSuccess {
        return Json(json!({})).into_response();
    }
    match state.radio.sta_info() {
        Ok(Some(info)) => Json(info).into_response(),
        Ok(None) => Json(json!({})).into_response(),
        Err(e) => {
            error!("Cannot read station info: {e:#}");
            Json(json!({})).into_response()
        }
    }
}

async fn wifi_disconnect(State(state): State<SharedState>) -> StatusCode {
    let cnt = state.next_api_cnt();
    info!("#{cnt} wifi_disconnect()");

    if let Err(e) = state.bus.wifi.send(WifiMsg::UserRequestedStaDisconnect).await {
        error!("{e:#}");
    }
    StatusCode::OK
}

async fn get_local_time(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let cnt = state.next_api_cnt();
    info!("#{cnt} get_local_time()");

    if state.local_time_set.load(Ordering::Acquire) {
        Json(json!({ "time": format_local_time(&state.clock.local_time()) }))
    } else {
        Json(json!({}))
    }
}

async fn get_ap_ssid(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let cnt = state.next_api_cnt();
    info!("#{cnt} get_ap_ssid()");

    let ssid = state.radio.ap_ssid().unwrap_or_else(|e| {
        error!("Cannot read AP config: {e:#}");
        state.config.ap_ssid.clone()
    });
    Json(json!({ "ssid": ssid }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Request};
    use tower::ServiceExt;

    struct Fixture {
        state: SharedState,
        rx: BusReceivers,
        sink: MemFirmwareSink,
    }

    fn fixture() -> Fixture {
        let (bus, rx) = Bus::new(8);
        let sink = MemFirmwareSink::default();
        let radio = SimRadio::new("ESP32_AP").with_network("HomeNet", "secret");
        let state = MyState::new(
            MyConfig::default(),
            bus,
            Arc::new(radio),
            Box::new(sink.clone()),
            Arc::new(SimClock::default()),
        )
        .shared();
        Fixture { state, rx, sink }
    }

    async fn call(state: &SharedState, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = api_router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    async fn call_json(state: &SharedState, req: Request<Body>) -> serde_json::Value {
        let (status, body) = call(state, req).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice(&body).unwrap()
    }

    fn req(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn ota_status_is_pending_before_any_update() {
        let f = fixture();
        let v = call_json(&f.state, req("POST", "/OTAstatus")).await;
        assert_eq!(v["ota_update_status"], 0);
        assert!(v["compile_time"].is_string());
        assert!(v["compile_date"].is_string());
    }

    #[tokio::test]
    async fn wifi_connect_writes_config_then_posts() {
        let mut f = fixture();
        let mut conf = f.state.sta_config.write().await;
        conf.overwrite(Some("previous-long-name"), Some("oldpassword"));
        drop(conf);

        let r = Request::builder()
            .method("POST")
            .uri("/wifiConnect.json")
            .header(HDR_CONNECT_SSID, "HomeNet")
            .header(HDR_CONNECT_PWD, "secret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&f.state, r).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());

        assert_eq!(f.rx.wifi.try_recv(), Some(WifiMsg::ConnectingFromHttpServer));
        let conf = f.state.sta_config.read().await;
        assert_eq!(conf.ssid(), "HomeNet");
        assert_eq!(conf.password(), "secret");
    }

    #[tokio::test]
    async fn wifi_connect_without_password_header() {
        let mut f = fixture();
        f.state.sta_config.write().await.overwrite(Some("x"), Some("stale"));

        let r = Request::builder()
            .method("POST")
            .uri("/wifiConnect.json")
            .header(HDR_CONNECT_SSID, "OpenNet")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&f.state, r).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(f.rx.wifi.try_recv(), Some(WifiMsg::ConnectingFromHttpServer));

        let conf = f.state.sta_config.read().await;
        assert_eq!(conf.ssid(), "OpenNet");
        assert!(conf.raw_password().iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn wifi_connect_decodes_non_ascii_headers() {
        let mut f = fixture();

        let r = Request::builder()
            .method("POST")
            .uri("/wifiConnect.json")
            .header(HDR_CONNECT_SSID, HeaderValue::from_bytes(b"Caf\xe9").unwrap())
            .header(HDR_CONNECT_PWD, HeaderValue::from_bytes("pässwörd".as_bytes()).unwrap())
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&f.state, r).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(f.rx.wifi.try_recv(), Some(WifiMsg::ConnectingFromHttpServer));

        let conf = f.state.sta_config.read().await;
        assert_eq!(conf.ssid(), "Café");
        assert_eq!(conf.password(), "pässwörd");
    }

    #[tokio::test]
    async fn disconnect_posts_message() {
        let mut f = fixture();
        let (status, _) = call(&f.state, req("DELETE", "/wifiDisconnect.json")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(f.rx.wifi.try_recv(), Some(WifiMsg::UserRequestedStaDisconnect));
    }

    #[tokio::test]
    async fn connect_status_and_info_follow_shared_state() {
        let f = fixture();
        let v = call_json(&f.state, req("POST", "/wifiConnectStatus")).await;
        assert_eq!(v, json!({ "wifi_connect_status": 0 }));
        let v = call_json(&f.state, req("GET", "/wifiConnectInfo.json")).await;
        assert_eq!(v, json!({}));

        f.state.set_wifi_connect_status(WifiConnectStatus::Connecting);
        let v = call_json(&f.state, req("POST", "/wifiConnectStatus")).await;
        assert_eq!(v["wifi_connect_status"], 1);
    }

    #[tokio::test]
    async fn local_time_empty_until_synced() {
        let f = fixture();
        let v = call_json(&f.state, req("GET", "/localTime.json")).await;
        assert_eq!(v, json!({}));

        f.state.local_time_set.store(true, Ordering::Release);
        let v = call_json(&f.state, req("GET", "/localTime.json")).await;
        assert!(v["time"].as_str().is_some_and(|t| !t.is_empty()));
    }

    #[tokio::test]
    async fn ap_ssid_and_sensor() {
        let f = fixture();
        let v = call_json(&f.state, req("GET", "/apSSID.json")).await;
        assert_eq!(v, json!({ "ssid": "ESP32_AP" }));

        *f.state.sensor.write().await = SensorReading {
            status: SensorStatus::Ok,
            temperature: 22,
            humidity: 41,
        };
        let v = call_json(&f.state, req("GET", "/dhtSensor.json")).await;
        assert_eq!(v, json!({ "status": "OK", "temp": 22, "humidity": 41 }));
    }

    #[tokio::test]
    async fn static_assets() {
        let f = fixture();
        let (status, body) = call(&f.state, req("GET", "/")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("ESP32_AP"));

        for path in ["/app.css", "/app.js", "/favicon.ico"] {
            let (status, body) = call(&f.state, req("GET", path)).await;
            assert_eq!(status, StatusCode::OK, "{path}");
            assert!(!body.is_empty(), "{path}");
        }
    }

    fn upload(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/OTAupdate")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn firmware_upload_success_is_reported() {
        let mut f = fixture();
        let image: Vec<u8> = std::iter::once(0xe9).chain((0..4000).map(|i| i as u8)).collect();
        let mut body = b"------B\r\nContent-Disposition: form-data; name=\"file\"\r\n\r\n".to_vec();
        body.extend_from_slice(&image);
        body.extend_from_slice(b"\r\n------B--\r\n");

        let (status, _) = call(&f.state, upload(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(f.rx.http.try_recv(), Some(HttpMsg::OtaUpdateSuccessful));
        assert_eq!(f.sink.committed(), Some(image));
    }

    #[tokio::test]
    async fn firmware_upload_failure_is_reported() {
        let mut f = fixture();
        f.sink.fail_validation(true);
        let (status, _) = call(&f.state, upload(vec![0xe9; 512])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(f.rx.http.try_recv(), Some(HttpMsg::OtaUpdateFailed));
        assert_eq!(f.sink.committed(), None);
    }

    #[tokio::test]
    async fn empty_upload_is_rejected_on_completion() {
        let mut f = fixture();
        let (status, _) = call(&f.state, upload(Vec::new())).await;
        assert_eq!(status, StatusCode::OK);
        // the in-memory sink rejects empty images
        assert_eq!(f.rx.http.try_recv(), Some(HttpMsg::OtaUpdateFailed));
    }

    #[tokio::test]
    async fn upload_after_success_is_ignored() {
        let mut f = fixture();
        f.state.set_ota_update_status(OtaUpdateStatus::Successful);
        let (status, _) = call(&f.state, upload(vec![0xe9; 64])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(f.rx.http.try_recv(), None);
        assert_eq!(f.sink.committed(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_queued_behind_success_is_ignored() {
        let mut f = fixture();
        let image = vec![0xe9; 100];

        let slow = futures::stream::once({
            let image = image.clone();
            async move {
                sleep(Duration::from_millis(200)).await;
                Ok::<_, std::io::Error>(image)
            }
        });
        let first = Request::builder()
            .method("POST")
            .uri("/OTAupdate")
            .header(header::CONTENT_LENGTH, image.len())
            .body(Body::from_stream(slow))
            .unwrap();
        let state = f.state.clone();
        let first = tokio::spawn(async move { call(&state, first).await });
        tokio::task::yield_now().await;

        // waits on the firmware slot until the first upload has committed
        let (status, _) = call(&f.state, upload(vec![1, 2, 3])).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = first.await.unwrap();
        assert_eq!(status, StatusCode::OK);

        assert_eq!(f.sink.committed(), Some(image));
        assert_eq!(f.rx.http.try_recv(), Some(HttpMsg::OtaUpdateSuccessful));
        assert_eq!(f.rx.http.try_recv(), None);
    }

    #[tokio::test]
    async fn control_surface_start_is_idempotent() {
        let (bus, rx) = Bus::new(8);
        let config = MyConfig {
            api_port: 0,
            ..Default::default()
        };
        let state = MyState::new(
            config,
            bus,
            Arc::new(SimRadio::new("ESP32_AP")),
            Box::new(MemFirmwareSink::default()),
            Arc::new(SimClock::default()),
        )
        .shared();
        let mut server = HttpServer::new(state, rx.http, Arc::new(RecordingRestarter::default()));

        assert!(!server.is_running());
        assert!(server.start());
        assert!(server.is_running());
        assert!(!server.start());

        server.stop();
        tokio::task::yield_now().await;
        assert!(!server.is_running());
        assert!(server.start());
        server.stop();
    }
}
// EOF
