use crate::chart;
use crate::websockets::{ServerRequestManager, SocketEvent};
use crate::widgets::token_panel;
use moeviz::scene::DisplayMode;
use moeviz::session::{AckDisposition, SessionController, SessionState};
use moeviz::topology::ModelRegistry;
use moeviz_server::{WebsocketClientServerMessage, WebsocketServerClientMessage};
use strum::IntoEnumIterator;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// A generation the user submitted and has not heard back about:
/// the wire request id plus the session token it belongs to.
#[derive(Debug, Clone, Copy)]
struct PendingGeneration {
    request_id: u64,
    session: u64,
}

pub struct MoeVizApp {
    socket_event_receiver: mpsc::UnboundedReceiver<SocketEvent>,
    request_manager: ServerRequestManager,
    controller: SessionController,
    connection: ConnectionStatus,
    prompt_text: String,
    status_line: Option<String>,
    latest_output: Option<String>,
    pending: Option<PendingGeneration>,
}

impl MoeVizApp {
    pub fn new(
        _cc: &eframe::CreationContext<'_>,
        socket_event_receiver: mpsc::UnboundedReceiver<SocketEvent>,
        client_server_sender: mpsc::UnboundedSender<WebsocketClientServerMessage>,
    ) -> Self {
        Self {
            socket_event_receiver,
            request_manager: ServerRequestManager::new(client_server_sender),
            controller: SessionController::new(ModelRegistry::builtin())
                .expect("builtin model registry is valid"),
            connection: ConnectionStatus::Connecting,
            prompt_text: String::new(),
            status_line: None,
            latest_output: None,
            pending: None,
        }
    }

    fn drain_socket_events(&mut self) {
        while let Ok(event) = self.socket_event_receiver.try_recv() {
            match event {
                SocketEvent::Opened => {
                    self.connection = ConnectionStatus::Connected;
                    self.status_line = None;
                }
                SocketEvent::Closed => {
                    // Freeze whatever streamed so far; the log survives a
                    // reconnect.
                    self.connection = ConnectionStatus::Disconnected;
                    self.status_line =
                        Some("connection lost, showing last streamed state".to_string());
                }
                SocketEvent::Message(msg) => self.handle_server_message(msg),
            }
        }

        if let Some(pending) = self.pending {
            if let Some(result) = self.request_manager.take_return(pending.request_id) {
                self.pending = None;
                match self.controller.acknowledge(pending.session, result) {
                    AckDisposition::Accepted { message } => {
                        self.latest_output = Some(message);
                    }
                    AckDisposition::Failed { error } => {
                        self.status_line = Some(format!("generation failed: {error}"));
                    }
                    AckDisposition::Stale => {}
                }
            }
        }
    }

    fn handle_server_message(&mut self, msg: WebsocketServerClientMessage) {
        match msg {
            WebsocketServerClientMessage::Pong => {}
            WebsocketServerClientMessage::ClientConfigReport(config) => {
                for (model_id, entry) in config.models {
                    self.controller.apply_model_override(
                        &model_id,
                        entry.display_name,
                        entry.expert_count,
                    );
                }
            }
            WebsocketServerClientMessage::RoutingUpdate(event) => {
                if self.controller.ingest(&event).is_err() {
                    self.status_line = Some(format!(
                        "dropped {} malformed routing event(s)",
                        self.controller.malformed_events()
                    ));
                }
            }
            WebsocketServerClientMessage::GenerationComplete => {
                self.controller.complete_generation();
            }
            WebsocketServerClientMessage::GenerateReturn { request_id, result } => {
                self.request_manager.new_return(request_id, result);
            }
        }
    }

    fn submit_prompt(&mut self) {
        let prompt = self.prompt_text.trim().to_string();
        if prompt.is_empty() {
            self.status_line = Some("enter a prompt first".to_string());
            return;
        }
        let Ok(session) = self.controller.begin_generation() else {
            // Already generating: rejected, not queued.
            return;
        };
        if let Some(old) = self.pending.take() {
            self.request_manager.cancel_request(old.request_id);
        }
        let model_id = self.controller.topology().model_id().to_string();
        let request_id = self.request_manager.submit_generate(prompt, model_id);
        self.pending = Some(PendingGeneration {
            request_id,
            session,
        });
        self.latest_output = None;
        self.status_line = None;
    }

    fn model_selector(&mut self, ui: &mut egui::Ui) {
        let current_id = self.controller.topology().model_id().to_string();
        let current_name = self.controller.topology().display_name().to_string();
        let models: Vec<(String, String)> = self
            .controller
            .registry()
            .iter()
            .map(|(id, entry)| (id.to_string(), entry.display_name.clone()))
            .collect();
        let mut selected = current_id.clone();
        egui::ComboBox::from_id_salt("model_selector")
            .selected_text(current_name)
            .show_ui(ui, |ui| {
                for (id, name) in &models {
                    ui.selectable_value(&mut selected, id.clone(), name);
                }
            });
        if selected != current_id {
            if let Err(err) = self.controller.select_model(&selected) {
                self.status_line = Some(err.to_string());
            }
        }
    }
}

impl eframe::App for MoeVizApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_socket_events();

        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            egui::menu::bar(ui, |ui| {
                egui::widgets::global_theme_preference_switch(ui);
                ui.heading("MoE Viz");
                ui.separator();
                self.model_selector(ui);
                ui.separator();
                let mut mode = self.controller.display_mode();
                for variant in DisplayMode::iter() {
                    ui.selectable_value(&mut mode, variant, variant.to_string());
                }
                if mode != self.controller.display_mode() {
                    self.controller.set_display_mode(mode);
                }
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    let (text, color) = match self.connection {
                        ConnectionStatus::Connecting => ("connecting…", egui::Color32::YELLOW),
                        ConnectionStatus::Connected => ("connected", egui::Color32::GREEN),
                        ConnectionStatus::Disconnected => ("disconnected", egui::Color32::RED),
                    };
                    ui.colored_label(color, text);
                });
            });
        });

        egui::TopBottomPanel::bottom("token_panel")
            .resizable(true)
            .show(ctx, |ui| {
                let scene = self.controller.render(ui.available_width());
                token_panel::show(ui, &scene.tokens, &mut self.controller);
                if let Some(output) = &self.latest_output {
                    ui.separator();
                    ui.label(output);
                }
                if let Some(status) = &self.status_line {
                    ui.separator();
                    ui.colored_label(egui::Color32::LIGHT_RED, status);
                }
            });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.horizontal(|ui| {
                let text_edit = egui::TextEdit::singleline(&mut self.prompt_text)
                    .hint_text("Prompt")
                    .desired_width(ui.available_width() - 120.0);
                let response = ui.add(text_edit);
                let generating = self.controller.state() == SessionState::Generating;
                let submit_clicked = ui
                    .add_enabled(!generating, egui::Button::new("Generate"))
                    .clicked();
                if generating {
                    ui.spinner();
                }
                let submit_entered = response.lost_focus()
                    && ui.input(|i| i.key_pressed(egui::Key::Enter))
                    && !generating;
                if submit_clicked || submit_entered {
                    self.submit_prompt();
                }
            });
            ui.separator();

            let scene = self.controller.render(ui.available_width());
            chart::show(ui, &scene, &mut self.controller);
        });
    }
}
