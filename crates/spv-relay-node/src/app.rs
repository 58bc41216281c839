//! Application server owning the relay and its store behind an async
//! message-passing interface.
//!
//! Every mutating request is processed to completion before the next one
//! is read from the channel, which gives the relay its single-writer,
//! no-partial-state execution model for free.

use std::path::PathBuf;

use bitcoin::{BlockHash, Txid, TxMerkleNode};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info};

use spv_relay::{
    Authority, FeeMeter, FeeParams, NetworkParams, NullPayer, Relay, RelayError, RelayEvent,
};

use crate::store::RelayStore;

/// Genesis bootstrap inputs, needed only for a fresh database.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub genesis_header: Vec<u8>,
    pub genesis_height: u64,
    pub period_start_hash_le: [u8; 32],
    pub finalization_parameter: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the relay database
    pub db_path: PathBuf,
    /// Api requests channel capacity
    pub api_requests_capacity: usize,
    /// Consensus parameters of the tracked chain
    pub params: NetworkParams,
    /// Fee and reward tuning
    pub fee_params: FeeParams,
    /// Bootstrap inputs, required when the database is empty
    pub bootstrap: Option<BootstrapConfig>,
}

/// Request sent to the application server via the API channel
pub struct ApiRequest {
    pub body: ApiRequestBody,
    pub tx_response: oneshot::Sender<ApiResponse>,
}

pub type ApiResponse = Result<ApiResponseBody, RelayError>;

/// Possible request operations that can be sent to the application server
pub enum ApiRequestBody {
    /// Submit a batch of headers anchored to a known parent
    SubmitHeaders {
        anchor: Vec<u8>,
        headers: Vec<u8>,
        submitter: String,
        owner: bool,
    },
    /// Submit headers crossing a difficulty epoch boundary
    SubmitHeadersWithRetarget {
        old_period_start: Vec<u8>,
        old_period_end: Vec<u8>,
        headers: Vec<u8>,
        submitter: String,
        owner: bool,
    },
    /// Check transaction inclusion in a finalized block
    CheckInclusion {
        txid: Txid,
        height: u64,
        proof: Vec<TxMerkleNode>,
        index: u32,
        payment: u64,
    },
    FindHeight(BlockHash),
    FindAncestor(BlockHash, u64),
    IsAncestor(BlockHash, BlockHash, u64),
    CandidateCount(u64),
    CandidateAt(u64, usize),
    Tip,
    FeeQuote,
    FinalizationParameter,
    SetPaused(bool),
    SetFinalizationParameter(u64),
    SetEpochLength(u64),
    SetFeeParams(FeeParams),
}

/// Response body for API requests containing the result data
pub enum ApiResponseBody {
    Events(Vec<RelayEvent>),
    Included(bool),
    Height(u64),
    Hash(BlockHash),
    MaybeHash(Option<BlockHash>),
    Bool(bool),
    Count(usize),
    Amount(u64),
    Done,
}

/// The main application server that processes API requests against the relay
pub struct AppServer {
    config: AppConfig,
    rx_requests: mpsc::Receiver<ApiRequest>,
    rx_shutdown: broadcast::Receiver<()>,
}

/// Client for communicating with the application server via async channels
#[derive(Clone)]
pub struct AppClient {
    pub(crate) tx_requests: mpsc::Sender<ApiRequest>,
}

/// Create app server and client
pub fn create_app(
    config: AppConfig,
    rx_shutdown: broadcast::Receiver<()>,
) -> (AppServer, AppClient) {
    let (tx_requests, rx_requests) = mpsc::channel(config.api_requests_capacity);
    let server = AppServer {
        config,
        rx_requests,
        rx_shutdown,
    };
    let client = AppClient { tx_requests };
    (server, client)
}

impl AppServer {
    /// Open the store and either restore the relay or bootstrap it.
    async fn open_relay(&self) -> Result<(Relay, RelayStore), anyhow::Error> {
        let store = RelayStore::open(&self.config.db_path).await?;

        if store.is_bootstrapped().await? {
            let persisted = store.load_state().await?;
            let chain = store.load_chain(persisted.state.genesis_hash).await?;
            let mut fees = FeeMeter::new(self.config.fee_params.clone());
            fees.restore(persisted.epoch_queries, persisted.native_pool);
            info!(
                tip = persisted.state.highest_height,
                "relay state restored from database"
            );
            let relay = Relay::from_parts(
                self.config.params.clone(),
                persisted.state,
                chain,
                fees,
                Box::new(NullPayer),
            );
            return Ok((relay, store));
        }

        let bootstrap = self
            .config
            .bootstrap
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("empty database and no genesis supplied"))?;
        let relay = Relay::initialize(
            &bootstrap.genesis_header,
            bootstrap.genesis_height,
            bootstrap.period_start_hash_le,
            bootstrap.finalization_parameter,
            self.config.params.clone(),
            self.config.fee_params.clone(),
            Box::new(NullPayer),
        )?;
        let genesis_hash = relay.state().genesis_hash;
        let genesis = relay
            .store()
            .node(&genesis_hash)
            .expect("genesis is in the index")
            .clone();
        store
            .bootstrap(genesis_hash, &genesis, relay.state(), relay.fees())
            .await?;
        Ok((relay, store))
    }

    async fn run_inner(&mut self) -> Result<(), anyhow::Error> {
        info!("App server started");
        let (mut relay, store) = self.open_relay().await?;
        // The owner token was already checked at the RPC boundary; the
        // server end of the channel is the trusted side.
        let authority = Authority::assume();

        loop {
            tokio::select! {
                Some(req) = self.rx_requests.recv() => {
                    let res = Self::handle(&mut relay, &store, &authority, req.body).await?;
                    req.tx_response
                        .send(res)
                        .map_err(|_| anyhow::anyhow!("Failed to send API response"))?;
                },
                _ = self.rx_shutdown.recv() => {
                    return Ok(())
                }
            }
        }
    }

    /// Process one request. Persistence failures are fatal for the server
    /// (outer `Err`); relay validation failures are returned to the caller.
    async fn handle(
        relay: &mut Relay,
        store: &RelayStore,
        authority: &Authority,
        body: ApiRequestBody,
    ) -> Result<ApiResponse, anyhow::Error> {
        let response = match body {
            ApiRequestBody::SubmitHeaders {
                anchor,
                headers,
                submitter,
                owner,
            } => {
                let result = if owner {
                    relay.owner_submit_headers(authority, &anchor, &headers, &submitter)
                } else {
                    relay.submit_headers(&anchor, &headers, &submitter)
                };
                match result {
                    Ok(events) => {
                        store
                            .apply(relay.state(), relay.fees(), relay.store(), &events)
                            .await?;
                        Ok(ApiResponseBody::Events(events))
                    }
                    Err(err) => Err(err),
                }
            }
            ApiRequestBody::SubmitHeadersWithRetarget {
                old_period_start,
                old_period_end,
                headers,
                submitter,
                owner,
            } => {
                let result = if owner {
                    relay.owner_submit_headers_with_retarget(
                        authority,
                        &old_period_start,
                        &old_period_end,
                        &headers,
                        &submitter,
                    )
                } else {
                    relay.submit_headers_with_retarget(
                        &old_period_start,
                        &old_period_end,
                        &headers,
                        &submitter,
                    )
                };
                match result {
                    Ok(events) => {
                        store
                            .apply(relay.state(), relay.fees(), relay.store(), &events)
                            .await?;
                        Ok(ApiResponseBody::Events(events))
                    }
                    Err(err) => Err(err),
                }
            }
            ApiRequestBody::CheckInclusion {
                txid,
                height,
                proof,
                index,
                payment,
            } => {
                let result = relay.check_inclusion(&txid, height, &proof, index, payment);
                // The fee counters move even on most validation failures.
                store
                    .apply(relay.state(), relay.fees(), relay.store(), &[])
                    .await?;
                result.map(ApiResponseBody::Included)
            }
            ApiRequestBody::FindHeight(hash) => {
                relay.find_height(&hash).map(ApiResponseBody::Height)
            }
            ApiRequestBody::FindAncestor(hash, offset) => relay
                .find_ancestor(&hash, offset)
                .map(ApiResponseBody::Hash),
            ApiRequestBody::IsAncestor(ancestor, descendant, limit) => Ok(ApiResponseBody::Bool(
                relay.is_ancestor(&ancestor, &descendant, limit),
            )),
            ApiRequestBody::CandidateCount(height) => Ok(ApiResponseBody::Count(
                relay.submitted_headers_at(height),
            )),
            ApiRequestBody::CandidateAt(height, index) => Ok(ApiResponseBody::MaybeHash(
                relay.block_hash_at(height, index),
            )),
            ApiRequestBody::Tip => Ok(ApiResponseBody::Height(relay.last_submitted_height())),
            ApiRequestBody::FeeQuote => Ok(ApiResponseBody::Amount(relay.required_fee())),
            ApiRequestBody::FinalizationParameter => {
                Ok(ApiResponseBody::Height(relay.finalization_parameter()))
            }
            ApiRequestBody::SetPaused(paused) => {
                if paused {
                    relay.pause(authority);
                } else {
                    relay.unpause(authority);
                }
                store
                    .apply(relay.state(), relay.fees(), relay.store(), &[])
                    .await?;
                Ok(ApiResponseBody::Done)
            }
            ApiRequestBody::SetFinalizationParameter(new) => {
                match relay.set_finalization_parameter(authority, new) {
                    Ok(()) => {
                        store
                            .apply(relay.state(), relay.fees(), relay.store(), &[])
                            .await?;
                        Ok(ApiResponseBody::Done)
                    }
                    Err(err) => Err(err),
                }
            }
            ApiRequestBody::SetEpochLength(new) => relay
                .set_epoch_length(authority, new)
                .map(|()| ApiResponseBody::Done),
            ApiRequestBody::SetFeeParams(params) => relay
                .set_fee_params(authority, params)
                .map(|()| ApiResponseBody::Done),
        };
        Ok(response)
    }

    pub async fn run(&mut self) -> Result<(), ()> {
        match self.run_inner().await {
            Err(err) => {
                error!("App server exited: {}", err);
                Err(())
            }
            Ok(()) => {
                info!("App server terminated");
                Ok(())
            }
        }
    }
}

impl AppClient {
    /// Helper method to send a request and handle the response
    async fn send_request<T>(
        &self,
        body: ApiRequestBody,
        extract_response: impl FnOnce(ApiResponseBody) -> Option<T>,
    ) -> Result<Result<T, RelayError>, anyhow::Error> {
        let (tx_response, rx_response) = oneshot::channel();
        self.tx_requests
            .send(ApiRequest { body, tx_response })
            .await
            .map_err(|_| anyhow::anyhow!("App server is gone"))?;

        let res = rx_response
            .await
            .map_err(|_| anyhow::anyhow!("App server dropped the request"))?;

        match res {
            Ok(response_body) => extract_response(response_body)
                .map(Ok)
                .ok_or_else(|| anyhow::anyhow!("Unexpected response type")),
            Err(err) => Ok(Err(err)),
        }
    }

    pub async fn submit_headers(
        &self,
        anchor: Vec<u8>,
        headers: Vec<u8>,
        submitter: String,
        owner: bool,
    ) -> Result<Result<Vec<RelayEvent>, RelayError>, anyhow::Error> {
        self.send_request(
            ApiRequestBody::SubmitHeaders {
                anchor,
                headers,
                submitter,
                owner,
            },
            |response| match response {
                ApiResponseBody::Events(events) => Some(events),
                _ => None,
            },
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn submit_headers_with_retarget(
        &self,
        old_period_start: Vec<u8>,
        old_period_end: Vec<u8>,
        headers: Vec<u8>,
        submitter: String,
        owner: bool,
    ) -> Result<Result<Vec<RelayEvent>, RelayError>, anyhow::Error> {
        self.send_request(
            ApiRequestBody::SubmitHeadersWithRetarget {
                old_period_start,
                old_period_end,
                headers,
                submitter,
                owner,
            },
            |response| match response {
                ApiResponseBody::Events(events) => Some(events),
                _ => None,
            },
        )
        .await
    }

    pub async fn check_inclusion(
        &self,
        txid: Txid,
        height: u64,
        proof: Vec<TxMerkleNode>,
        index: u32,
        payment: u64,
    ) -> Result<Result<bool, RelayError>, anyhow::Error> {
        self.send_request(
            ApiRequestBody::CheckInclusion {
                txid,
                height,
                proof,
                index,
                payment,
            },
            |response| match response {
                ApiResponseBody::Included(included) => Some(included),
                _ => None,
            },
        )
        .await
    }

    pub async fn find_height(
        &self,
        hash: BlockHash,
    ) -> Result<Result<u64, RelayError>, anyhow::Error> {
        self.send_request(ApiRequestBody::FindHeight(hash), |response| match response {
            ApiResponseBody::Height(height) => Some(height),
            _ => None,
        })
        .await
    }

    pub async fn find_ancestor(
        &self,
        hash: BlockHash,
        offset: u64,
    ) -> Result<Result<BlockHash, RelayError>, anyhow::Error> {
        self.send_request(
            ApiRequestBody::FindAncestor(hash, offset),
            |response| match response {
                ApiResponseBody::Hash(hash) => Some(hash),
                _ => None,
            },
        )
        .await
    }

    pub async fn is_ancestor(
        &self,
        ancestor: BlockHash,
        descendant: BlockHash,
        limit: u64,
    ) -> Result<Result<bool, RelayError>, anyhow::Error> {
        self.send_request(
            ApiRequestBody::IsAncestor(ancestor, descendant, limit),
            |response| match response {
                ApiResponseBody::Bool(value) => Some(value),
                _ => None,
            },
        )
        .await
    }

    pub async fn candidate_count(
        &self,
        height: u64,
    ) -> Result<Result<usize, RelayError>, anyhow::Error> {
        self.send_request(
            ApiRequestBody::CandidateCount(height),
            |response| match response {
                ApiResponseBody::Count(count) => Some(count),
                _ => None,
            },
        )
        .await
    }

    pub async fn candidate_at(
        &self,
        height: u64,
        index: usize,
    ) -> Result<Result<Option<BlockHash>, RelayError>, anyhow::Error> {
        self.send_request(
            ApiRequestBody::CandidateAt(height, index),
            |response| match response {
                ApiResponseBody::MaybeHash(hash) => Some(hash),
                _ => None,
            },
        )
        .await
    }

    pub async fn tip(&self) -> Result<Result<u64, RelayError>, anyhow::Error> {
        self.send_request(ApiRequestBody::Tip, |response| match response {
            ApiResponseBody::Height(height) => Some(height),
            _ => None,
        })
        .await
    }

    pub async fn fee_quote(&self) -> Result<Result<u64, RelayError>, anyhow::Error> {
        self.send_request(ApiRequestBody::FeeQuote, |response| match response {
            ApiResponseBody::Amount(amount) => Some(amount),
            _ => None,
        })
        .await
    }

    pub async fn finalization_parameter(&self) -> Result<Result<u64, RelayError>, anyhow::Error> {
        self.send_request(
            ApiRequestBody::FinalizationParameter,
            |response| match response {
                ApiResponseBody::Height(value) => Some(value),
                _ => None,
            },
        )
        .await
    }

    pub async fn set_paused(&self, paused: bool) -> Result<Result<(), RelayError>, anyhow::Error> {
        self.send_request(ApiRequestBody::SetPaused(paused), |response| {
            match response {
                ApiResponseBody::Done => Some(()),
                _ => None,
            }
        })
        .await
    }

    pub async fn set_finalization_parameter(
        &self,
        new: u64,
    ) -> Result<Result<(), RelayError>, anyhow::Error> {
        self.send_request(
            ApiRequestBody::SetFinalizationParameter(new),
            |response| match response {
                ApiResponseBody::Done => Some(()),
                _ => None,
            },
        )
        .await
    }

    pub async fn set_epoch_length(&self, new: u64) -> Result<Result<(), RelayError>, anyhow::Error> {
        self.send_request(ApiRequestBody::SetEpochLength(new), |response| {
            match response {
                ApiResponseBody::Done => Some(()),
                _ => None,
            }
        })
        .await
    }

    pub async fn set_fee_params(
        &self,
        params: FeeParams,
    ) -> Result<Result<(), RelayError>, anyhow::Error> {
        self.send_request(ApiRequestBody::SetFeeParams(params), |response| {
            match response {
                ApiResponseBody::Done => Some(()),
                _ => None,
            }
        })
        .await
    }
}
