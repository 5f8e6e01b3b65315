use std::time::Duration;

use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use log::error;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::blockchain::chain::validate_blocks;
use crate::blockchain::{
    Address, Block, Blockchain, BlockchainError, DigitalSignature, MiningSignal, Transaction,
    Wallet,
};

/// Data structure for the ledger handle
pub type BlockchainData = web::Data<Blockchain>;

/// Reward address used when a mine request names none
const DEFAULT_MINER: &str = "anonymous";

/// Response for the root endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct NodeInfo {
    pub message: String,
    pub chain_length: usize,
    /// Hash of the chain tip
    pub last_hash: String,
    pub pending: usize,
}

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The blocks in the chain
    pub chain: Vec<Block>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Response for the validate endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ValidationResponse {
    pub valid: bool,

    /// First violation found, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request for the transaction endpoint.
///
/// The client signs the transaction id, which is the SHA-256 hex digest of
/// `sender ‖ recipient ‖ amount (8 decimals) ‖ timestamp (RFC 3339, millis)`.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// The sender's address
    pub sender: String,

    /// The recipient's address
    pub recipient: String,

    /// The amount to transfer
    pub amount: f64,

    /// Creation time the signature was made for
    #[schema(value_type = String, example = "2023-01-01T12:00:00.000Z")]
    pub timestamp: DateTime<Utc>,

    /// Base58 signature over the transaction id
    pub signature: String,
}

/// Response for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    pub message: String,

    /// Id of the accepted transaction
    pub id: String,
}

/// Request for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineRequest {
    /// The miner's address
    #[serde(default)]
    pub miner_address: Option<String>,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    pub message: String,

    /// The newly mined block
    pub block: Block,
}

/// Query for the balance endpoint
#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct BalanceQuery {
    /// Ledger address
    pub address: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub address: String,
    pub balance: f64,
}

/// Response for the create wallet endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct WalletResponse {
    /// The wallet's address
    pub address: String,

    /// The wallet's private key (hex encoded)
    pub private_key: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,

    /// Whether the same request may succeed if repeated
    #[serde(default)]
    pub retryable: bool,
}

fn error_response(err: &BlockchainError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.to_string(),
        retryable: err.is_retryable(),
    };

    match err {
        BlockchainError::InvalidTransaction(_) => HttpResponse::UnprocessableEntity().json(body),
        BlockchainError::Persistence(_) => HttpResponse::InternalServerError().json(body),
        BlockchainError::MiningAborted(_) => HttpResponse::ServiceUnavailable().json(body),
        BlockchainError::TipChanged { .. } => HttpResponse::Conflict().json(body),
        BlockchainError::ConfirmationFailed { .. } => {
            HttpResponse::InternalServerError().json(body)
        }
    }
}

/// Cancels the search when the request is dropped mid-flight
struct CancelOnDrop(MiningSignal);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Node summary
#[utoipa::path(
    get,
    path = "/api/v1/",
    responses(
        (status = 200, description = "Node summary", body = NodeInfo)
    )
)]
pub async fn node_info(blockchain: BlockchainData) -> impl Responder {
    HttpResponse::Ok().json(NodeInfo {
        message: "Hash-chained ledger node".to_string(),
        chain_length: blockchain.len(),
        last_hash: blockchain.get_last_block().hash,
        pending: blockchain.get_pending_transactions().len(),
    })
}

/// Get the full blockchain
///
/// Returns the entire chain and its validity status
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(blockchain: BlockchainData) -> impl Responder {
    let chain = blockchain.get_chain();
    // Judge the copy being returned, not whatever the ledger holds by now
    let is_valid = validate_blocks(&chain).is_ok();

    HttpResponse::Ok().json(ChainResponse {
        length: chain.len(),
        chain,
        is_valid,
    })
}

/// Get all pending transactions
///
/// Returns all transactions waiting to be included in a block
#[utoipa::path(
    get,
    path = "/api/v1/transactions/pending",
    responses(
        (status = 200, description = "Pending transactions retrieved successfully", body = Vec<Transaction>)
    )
)]
pub async fn get_pending_transactions(blockchain: BlockchainData) -> impl Responder {
    HttpResponse::Ok().json(blockchain.get_pending_transactions())
}

/// Submit a signed transaction
///
/// Adds the transaction to the pending pool
#[utoipa::path(
    post,
    path = "/api/v1/transactions/new",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction accepted", body = TransactionResponse),
        (status = 422, description = "Invalid transaction", body = ErrorResponse),
        (status = 500, description = "Transaction could not be persisted", body = ErrorResponse)
    )
)]
pub async fn new_transaction(
    blockchain: BlockchainData,
    transaction_req: web::Json<TransactionRequest>,
) -> impl Responder {
    let request = transaction_req.into_inner();

    let mut transaction = Transaction::with_timestamp(
        Address(request.sender),
        Address(request.recipient),
        request.amount,
        request.timestamp,
    );
    transaction.attach_signature(DigitalSignature(request.signature));

    match blockchain.submit_transaction(transaction) {
        Ok(id) => HttpResponse::Created().json(TransactionResponse {
            message: "Transaction added".to_string(),
            id,
        }),
        Err(err) => error_response(&err),
    }
}

/// Mine a new block
///
/// Seals every pending transaction into a new block behind a reward
/// transaction for the miner
#[utoipa::path(
    post,
    path = "/api/v1/mine",
    request_body = MineRequest,
    responses(
        (status = 200, description = "Block mined successfully", body = MineResponse),
        (status = 409, description = "Chain tip moved while mining, retry", body = ErrorResponse),
        (status = 500, description = "Block or its confirmations could not be persisted", body = ErrorResponse),
        (status = 503, description = "Mining timed out", body = ErrorResponse)
    )
)]
pub async fn mine_block(
    blockchain: BlockchainData,
    mine_req: Option<web::Json<MineRequest>>,
) -> impl Responder {
    let miner_address = mine_req
        .and_then(|req| req.into_inner().miner_address)
        .filter(|address| !address.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MINER.to_string());
    let miner_address = Address(miner_address);

    let timeout = Duration::from_secs(blockchain.config().mining_timeout_secs);
    let signal = MiningSignal::with_timeout(timeout);
    let _guard = CancelOnDrop(signal.clone());

    let ledger = blockchain.clone();
    let result = web::block(move || ledger.mine_pending_transactions_with(&miner_address, &signal)).await;

    match result {
        Ok(Ok(block)) => HttpResponse::Ok().json(MineResponse {
            message: "Block mined".to_string(),
            block,
        }),
        Ok(Err(err)) => error_response(&err),
        Err(err) => {
            error!("Mining worker failed: {}", err);
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Mining worker failed".to_string(),
                retryable: false,
            })
        }
    }
}

/// Check if the blockchain is valid
///
/// Re-verifies every block and transaction
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = ValidationResponse)
    )
)]
pub async fn validate_chain(blockchain: BlockchainData) -> impl Responder {
    let response = match blockchain.validate_chain() {
        Ok(()) => ValidationResponse {
            valid: true,
            error: None,
        },
        Err(corruption) => ValidationResponse {
            valid: false,
            error: Some(corruption.to_string()),
        },
    };

    HttpResponse::Ok().json(response)
}

/// Get the balance of an address
#[utoipa::path(
    get,
    path = "/api/v1/balance",
    params(BalanceQuery),
    responses(
        (status = 200, description = "Balance retrieved successfully", body = BalanceResponse),
        (status = 400, description = "Address missing", body = ErrorResponse)
    )
)]
pub async fn get_balance(
    blockchain: BlockchainData,
    query: web::Query<BalanceQuery>,
) -> impl Responder {
    let Some(address) = query.into_inner().address.filter(|a| !a.is_empty()) else {
        return HttpResponse::BadRequest().json(ErrorResponse {
            error: "address required".to_string(),
            retryable: false,
        });
    };

    let address = Address(address);
    let balance = blockchain.get_balance(&address);

    HttpResponse::Ok().json(BalanceResponse {
        address: address.0,
        balance,
    })
}

/// Create a new wallet
///
/// Development helper; the ledger itself never stores keys
#[utoipa::path(
    post,
    path = "/api/v1/wallet/new",
    responses(
        (status = 200, description = "Wallet created successfully", body = WalletResponse)
    )
)]
pub async fn create_wallet() -> impl Responder {
    let wallet = Wallet::new();

    HttpResponse::Ok().json(WalletResponse {
        address: wallet.address().to_string(),
        private_key: hex::encode(wallet.export_secret_key()),
    })
}
