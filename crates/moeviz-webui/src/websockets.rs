use moeviz_server::{WebsocketClientServerMessage, WebsocketServerClientMessage};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::Closure;
use web_sys::{WebSocket, js_sys};

/// Transport-level event stream handed to the app: connection lifecycle
/// plus decoded server messages.
#[derive(Debug)]
pub(crate) enum SocketEvent {
    Opened,
    Closed,
    Message(WebsocketServerClientMessage),
}

/// Owns the client half of generation requests: hands out request ids and
/// drops returns for requests no longer active, so an acknowledgement that
/// arrives after its session was superseded never reaches the controller.
pub(crate) struct ServerRequestManager {
    client_server_sender: mpsc::UnboundedSender<WebsocketClientServerMessage>,
    incoming_returns: HashMap<u64, Result<String, String>>,
    active_requests: HashSet<u64>,
    next_request_id: u64,
}

impl ServerRequestManager {
    pub fn new(client_server_sender: mpsc::UnboundedSender<WebsocketClientServerMessage>) -> Self {
        Self {
            client_server_sender,
            incoming_returns: HashMap::new(),
            active_requests: HashSet::new(),
            next_request_id: 0,
        }
    }

    pub fn submit_generate(&mut self, prompt: String, model_id: String) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.active_requests.insert(request_id);
        if self
            .client_server_sender
            .send(WebsocketClientServerMessage::Generate {
                request_id,
                prompt,
                model_id,
            })
            .is_err()
        {
            log::error!("websocket task is gone, cannot submit generation");
        }
        request_id
    }

    pub fn new_return(&mut self, request_id: u64, result: Result<String, String>) {
        if self.active_requests.contains(&request_id) {
            self.incoming_returns.insert(request_id, result);
        } else {
            log::debug!("dropping return for inactive request {request_id}");
        }
    }

    pub fn take_return(&mut self, request_id: u64) -> Option<Result<String, String>> {
        let result = self.incoming_returns.remove(&request_id)?;
        self.active_requests.remove(&request_id);
        Some(result)
    }

    pub fn cancel_request(&mut self, request_id: u64) {
        self.active_requests.remove(&request_id);
        self.incoming_returns.remove(&request_id);
    }
}

pub(crate) async fn websocket_task(
    socket_event_sender: mpsc::UnboundedSender<SocketEvent>,
    mut client_server_receiver: mpsc::UnboundedReceiver<WebsocketClientServerMessage>,
    context: egui::Context,
) {
    let ws = match WebSocket::new("/ws") {
        Ok(ws) => ws,
        Err(err) => {
            log::error!("failed to open websocket: {err:?}");
            let _ = socket_event_sender.send(SocketEvent::Closed);
            return;
        }
    };

    // Set up event handlers
    let open_sender = socket_event_sender.clone();
    let onopen_callback = Closure::wrap(Box::new(move || {
        log::debug!("WebSocket connection opened");
        let _ = open_sender.send(SocketEvent::Opened);
    }) as Box<dyn FnMut()>);
    ws.set_onopen(Some(onopen_callback.as_ref().unchecked_ref()));
    onopen_callback.forget();

    // Handle messages coming from the server
    let message_sender = socket_event_sender.clone();
    let message_context = context.clone();
    let onmessage_callback = Closure::wrap(Box::new(move |e: web_sys::MessageEvent| {
        let context = message_context.clone();
        match e.data().dyn_into::<web_sys::Blob>() {
            Ok(blob) => {
                let fr = web_sys::FileReader::new().unwrap();
                let fr_c = fr.clone();
                let sender_clone = message_sender.clone();
                let onloadend_cb =
                    Closure::<dyn FnMut(_)>::new(move |_e: web_sys::ProgressEvent| {
                        let array = js_sys::Uint8Array::new(&fr_c.result().unwrap());
                        let vec = array.to_vec();

                        match ciborium::from_reader::<WebsocketServerClientMessage, _>(
                            vec.as_slice(),
                        ) {
                            Ok(msg) => {
                                let _ = sender_clone.send(SocketEvent::Message(msg));
                                context.request_repaint_after(Duration::from_millis(20));
                            }
                            Err(err) => {
                                log::warn!("Failed to decode message: {:?}", err);
                            }
                        }
                    });
                fr.set_onloadend(Some(onloadend_cb.as_ref().unchecked_ref()));
                fr.read_as_array_buffer(&blob).expect("blob not readable");
                onloadend_cb.forget();
            }
            Err(err) => {
                log::warn!("Failed to decode message: {:?}", err);
            }
        }
    }) as Box<dyn FnMut(web_sys::MessageEvent)>);
    ws.set_onmessage(Some(onmessage_callback.as_ref().unchecked_ref()));
    onmessage_callback.forget();

    // Handle errors
    let onerror_callback = Closure::wrap(Box::new(move |e: web_sys::ErrorEvent| {
        log::error!("WebSocket error: {}", e.message());
    }) as Box<dyn FnMut(web_sys::ErrorEvent)>);
    ws.set_onerror(Some(onerror_callback.as_ref().unchecked_ref()));
    onerror_callback.forget();

    // Handle closing
    let close_sender = socket_event_sender.clone();
    let close_context = context.clone();
    let onclose_callback = Closure::wrap(Box::new(move |e: web_sys::CloseEvent| {
        log::debug!("WebSocket closed: {} - {}", e.code(), e.reason());
        let _ = close_sender.send(SocketEvent::Closed);
        close_context.request_repaint_after(Duration::from_millis(20));
    }) as Box<dyn FnMut(web_sys::CloseEvent)>);
    ws.set_onclose(Some(onclose_callback.as_ref().unchecked_ref()));
    onclose_callback.forget();

    // Process messages from the client to send to the server
    let ws_clone = ws.clone();
    while let Some(message) = client_server_receiver.recv().await {
        let mut data = Vec::<u8>::new();
        if let Err(err) = ciborium::into_writer(&message, &mut data) {
            log::error!("failed to encode message: {err}");
            continue;
        }
        if let Err(err) = ws_clone.send_with_u8_array(&data) {
            log::warn!("failed to send message: {err:?}");
        }
    }
}
