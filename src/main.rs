use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use hashchain_ledger::api;
use hashchain_ledger::blockchain::{self, storage, Blockchain};
use hashchain_ledger::config::{self, NodeConfig};

fn initialize_blockchain(config: &NodeConfig) -> anyhow::Result<Blockchain> {
    // Storage first; a store that cannot be opened stops startup
    let store = storage::open_store(&config.storage)
        .with_context(|| format!("failed to open ledger storage at {}", config.storage.path))?;

    let blockchain = Blockchain::open(store, config.ledger.clone())
        .context("failed to rebuild the ledger from storage")?;

    match blockchain.validate_chain() {
        Ok(()) => info!("Ledger ready with {} blocks", blockchain.len()),
        Err(corruption) => warn!("Stored chain failed verification: {}", corruption),
    }

    Ok(blockchain)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::node_info,
        api::handlers::get_chain,
        api::handlers::get_pending_transactions,
        api::handlers::new_transaction,
        api::handlers::mine_block,
        api::handlers::validate_chain,
        api::handlers::get_balance,
        api::handlers::create_wallet
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::crypto::Address,
            blockchain::crypto::DigitalSignature,
            api::handlers::NodeInfo,
            api::handlers::ChainResponse,
            api::handlers::ValidationResponse,
            api::handlers::TransactionRequest,
            api::handlers::TransactionResponse,
            api::handlers::MineRequest,
            api::handlers::MineResponse,
            api::handlers::BalanceResponse,
            api::handlers::WalletResponse,
            api::handlers::ErrorResponse
        )
    ),
    tags(
        (name = "ledger", description = "Ledger API endpoints")
    ),
    info(
        title = "Ledger API",
        version = "0.1.0",
        description = "A single-node hash-chained ledger",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = config::load_config().context("failed to load configuration")?;

    // Storage first, then the ledger, then the server
    let blockchain = web::Data::new(initialize_blockchain(&config)?);

    let (host, port) = (config.server.host.clone(), config.server.port);
    info!("Starting HTTP server at http://{}:{}", host, port);

    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(blockchain.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;

    Ok(())
}
