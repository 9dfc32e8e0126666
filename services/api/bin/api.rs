//! Main Entrypoint for the MedForce API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Building the object store, board client and clinical tool set.
//! 3. Initializing the model clients (chat, speech, realtime voice).
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use gemini_realtime::GeminiLiveProvider;
use medforce_api::{
    config::{Config, Provider},
    router::create_router,
    state::AppState,
    ws::{
        agent_cache::AgentCache,
        orchestrator::{LiveAgentOrchestrator, VoiceBackend},
        responder::{ResponderSettings, StreamingResponder},
    },
};
use medforce_core::{
    agent::DEFAULT_CHAT_PROMPT,
    board::HttpBoardClient,
    clinical_tools::clinical_toolset,
    intake::{DEFAULT_INTAKE_PROMPT, ModelIntakeAgent, ObjectScheduleStore},
    llm_client::{LLMClient, OpenAICompatibleClient},
    records::{FsObjectStore, ObjectStore, PatientRecords},
    speech::{OpenAISpeechSynthesizer, SpeechSynthesizer},
    telemetry::tracing_sink,
};
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// Loads `*.md` prompt overrides keyed by file stem. A missing directory
/// means no overrides.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    if !prompts_path.is_dir() {
        return Ok(prompts);
    }
    for entry in std::fs::read_dir(prompts_path)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    let prompts = load_prompts(&config.prompts_path)?;
    let prompt = |key: &str, default: &str| {
        prompts
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };
    let chat_prompt = prompt("chat_prompt", DEFAULT_CHAT_PROMPT);
    let intake_prompt = prompt("intake_prompt", DEFAULT_INTAKE_PROMPT);
    let voice_prompt = prompt("voice_prompt", &chat_prompt);

    // --- 3. Records, Board and Tools ---
    let telemetry = tracing_sink();
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.data_root));
    let records = PatientRecords::new(store.clone());
    let board = Arc::new(
        HttpBoardClient::new(&config.board_base_url, telemetry.clone())
            .context("Failed to build the board client")?,
    );
    let tools = Arc::new(clinical_toolset(records.clone(), board, telemetry)?);
    info!(tools = ?tools.tool_names(), data_root = %config.data_root.display(), "Clinical tools registered");

    // --- 4. Model Clients ---
    let openai_config = match &config.provider {
        Provider::OpenAI => {
            info!("Using OpenAI provider.");
            let api_key = config
                .openai_api_key
                .as_ref()
                .context("OPENAI_API_KEY is required")?;
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://api.openai.com/v1/")
        }
        Provider::Gemini => {
            info!("Using Gemini provider.");
            let api_key = config
                .gemini_api_key
                .as_ref()
                .context("GEMINI_API_KEY is required")?;
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://generativelanguage.googleapis.com/v1beta/openai")
        }
    };
    let llm_client: Arc<dyn LLMClient> =
        Arc::new(OpenAICompatibleClient::new(openai_config, config.chat_model.clone()));

    let speech: Option<Arc<dyn SpeechSynthesizer>> = config.openai_api_key.as_ref().map(|key| {
        Arc::new(OpenAISpeechSynthesizer::new(
            OpenAIConfig::new().with_api_key(key),
        )) as Arc<dyn SpeechSynthesizer>
    });
    if speech.is_none() {
        warn!("OPENAI_API_KEY not set; voice_response requests will be refused");
    }

    let intake = Arc::new(ModelIntakeAgent::new(
        llm_client.clone(),
        records.clone(),
        Arc::new(ObjectScheduleStore::new(store)),
        intake_prompt,
    ));
    let responder = StreamingResponder::new(
        llm_client,
        tools.clone(),
        speech,
        ResponderSettings {
            max_tool_rounds: config.max_tool_rounds,
            words_per_chunk: config.stream_words_per_chunk,
            chunk_delay: Duration::from_millis(config.stream_chunk_delay_ms),
        },
    );

    let mut orchestrator = LiveAgentOrchestrator::new(
        AgentCache::new(config.agent_cache_capacity, chat_prompt),
        intake,
        responder,
        tools,
        records,
    );
    if config.voice_available() {
        if let Some(api_key) = &config.gemini_api_key {
            info!(model = %config.live_model, voice = %config.voice_name, "Voice channel enabled");
            orchestrator = orchestrator.with_voice(
                VoiceBackend {
                    provider: Arc::new(GeminiLiveProvider::new(api_key, &config.live_model)),
                    voice_name: Some(config.voice_name.clone()),
                    client_sample_rate: config.client_sample_rate,
                },
                voice_prompt,
            );
        }
    } else {
        warn!("Voice channel disabled");
    }

    let app_state = Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        config: Arc::new(config.clone()),
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
