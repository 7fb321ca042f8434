// ===============================
// src/evm.rs (chain transaction engine)
// ===============================
//
// One EvmClient per supported network, constructed once at startup and passed
// by handle (no global singletons). Composes:
//   - gas pricing snapshot cache (TTL 15s, retry with cooldown on miss)
//   - fresh-per-send account fetch (pending nonce + native balance)
//   - ERC-20 transfer build with memo bytes appended after the calldata
//   - gas estimation with per-network safety buffer, fixed fallback
//   - EIP-1559 vs legacy fee selection from the snapshot
//   - local signing with sender address verification
//
// Memo convention: trailing bytes after the standard transfer(address,uint256)
// call data. Best-effort side channel for the off-chain settlement watcher —
// the receiving contract must tolerate trailing bytes; nothing at the protocol
// level guarantees delivery.

use std::time::{Duration, Instant};

use ethers::abi::{self, Token};
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockNumber, Bytes, Eip1559TransactionRequest, TransactionRequest, H256, U256,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::metrics::{GAS_CACHE, GAS_FETCH_RETRIES};

pub const GAS_CACHE_TTL: Duration = Duration::from_secs(15);
pub const GAS_FETCH_MAX_RETRIES: usize = 5;
pub const GAS_FETCH_COOLDOWN: Duration = Duration::from_secs(10);
/// Fixed timeout on every outbound RPC call.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(20);

/// Quote currency (USDC) smallest-unit decimals.
pub const USDC_DECIMALS: u32 = 6;
/// Tokenized-asset smallest-unit decimals.
pub const ASSET_DECIMALS: u32 = 18;

const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Network {
    Ethereum,
    Arbitrum,
    Base,
    Bnb,
}

impl Network {
    pub fn name(&self) -> &'static str {
        match self {
            Network::Ethereum => "ethereum",
            Network::Arbitrum => "arbitrum",
            Network::Base => "base",
            Network::Bnb => "bnb",
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            Network::Ethereum => 1,
            Network::Arbitrum => 42161,
            Network::Base => 8453,
            Network::Bnb => 56,
        }
    }

    pub fn rpc_url(&self, api_key: &str) -> String {
        let base = match self {
            Network::Ethereum => "https://eth-mainnet.g.alchemy.com/v2",
            Network::Arbitrum => "https://arb-mainnet.g.alchemy.com/v2",
            Network::Base => "https://base-mainnet.g.alchemy.com/v2",
            Network::Bnb => "https://bnb-mainnet.g.alchemy.com/v2",
        };
        format!("{base}/{api_key}")
    }

    pub fn api_key_env(&self) -> &'static str {
        match self {
            Network::Ethereum => "ALCHEMY_ETH_API_KEY",
            Network::Arbitrum => "ALCHEMY_ARB_API_KEY",
            Network::Base => "ALCHEMY_BASE_API_KEY",
            Network::Bnb => "ALCHEMY_BNB_API_KEY",
        }
    }

    pub fn usdc_address(&self) -> &'static str {
        match self {
            Network::Ethereum => "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
            Network::Arbitrum => "0xaf88d065e77c8cC2239327C5EDb3A432268e5831",
            Network::Base => "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            Network::Bnb => "0x8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d",
        }
    }

    /// Gas-limit safety buffer, percent. L2s need larger buffers because
    /// their execution cost model differs from L1.
    pub fn gas_buffer_pct(&self) -> u64 {
        match self {
            Network::Ethereum => 125,
            Network::Arbitrum => 140,
            Network::Base => 135,
            Network::Bnb => 120,
        }
    }

    /// Fixed minimum used when live estimation fails.
    pub fn fallback_gas_limit(&self) -> u64 {
        match self {
            Network::Arbitrum | Network::Base => 150_000,
            _ => 100_000,
        }
    }

    pub fn native_currency(&self) -> &'static str {
        match self {
            Network::Bnb => "BNB",
            _ => "ETH",
        }
    }

    /// The zero-native-balance guard is skipped on BNB only. Looks like an
    /// oversight rather than an exemption; kept as-is instead of silently
    /// fixed (see DESIGN.md).
    pub fn skips_zero_balance_guard(&self) -> bool {
        matches!(self, Network::Bnb)
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc error: {0}")]
    Rpc(#[from] ProviderError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    // Key material is never included in error text.
    #[error("invalid private key")]
    InvalidKey,
    #[error("private key address {derived} does not match transaction sender {declared}")]
    AddressMismatch { derived: String, declared: String },
    #[error("insufficient {currency} balance for gas fees: 0")]
    InsufficientGasFunds { currency: &'static str },
    #[error("gas pricing fetch failed after {attempts} attempts: {last}")]
    GasPricing { attempts: usize, last: String },
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Latest gas pricing for one network. Replaced atomically as a whole; valid
/// for GAS_CACHE_TTL from `fetched_at`.
#[derive(Clone, Debug)]
pub struct GasSnapshot {
    pub block_number: u64,
    pub base_fee: Option<U256>,
    pub use_eip1559: bool,
    pub priority_fee: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub gas_price: Option<U256>,
    pub fetched_at: Instant,
}

impl GasSnapshot {
    pub fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.fetched_at) < ttl
    }
}

#[derive(Debug)]
pub struct GasCache {
    inner: Mutex<Option<GasSnapshot>>,
    ttl: Duration,
}

impl GasCache {
    pub fn new(ttl: Duration) -> Self {
        Self { inner: Mutex::new(None), ttl }
    }

    pub async fn get_fresh(&self) -> Option<GasSnapshot> {
        let guard = self.inner.lock().await;
        guard.as_ref().filter(|s| s.is_fresh(self.ttl, Instant::now())).cloned()
    }

    pub async fn store(&self, snap: GasSnapshot) {
        *self.inner.lock().await = Some(snap);
    }
}

/// Nonce and native balance, fetched together per signing attempt. Never
/// cached: `nonce` reflects pending transactions to avoid collisions.
#[derive(Clone, Debug)]
pub struct AccountSnapshot {
    pub nonce: U256,
    pub balance: U256,
    pub address: Address,
}

pub fn parse_address(s: &str) -> Result<Address, ChainError> {
    s.parse::<Address>().map_err(|_| ChainError::InvalidAddress(s.to_string()))
}

pub fn erc20_transfer_calldata(recipient: Address, amount: U256) -> Vec<u8> {
    let mut data = TRANSFER_SELECTOR.to_vec();
    data.extend(abi::encode(&[Token::Address(recipient), Token::Uint(amount)]));
    data
}

pub fn erc20_balance_of_calldata(owner: Address) -> Vec<u8> {
    let mut data = BALANCE_OF_SELECTOR.to_vec();
    data.extend(abi::encode(&[Token::Address(owner)]));
    data
}

/// Memo rides as raw UTF-8 bytes after the standard calldata.
pub fn append_memo(mut calldata: Vec<u8>, memo_text: &str) -> Vec<u8> {
    calldata.extend_from_slice(memo_text.as_bytes());
    calldata
}

pub fn buffered_gas_limit(network: Network, estimate: U256) -> U256 {
    estimate * U256::from(network.gas_buffer_pct()) / U256::from(100u64)
}

/// Attach fee fields from the snapshot. The two fee representations are
/// mutually exclusive on a single transaction.
pub fn build_transfer_tx(
    network: Network,
    from: Address,
    token: Address,
    data: Vec<u8>,
    nonce: U256,
    gas_limit: U256,
    snap: &GasSnapshot,
) -> TypedTransaction {
    if snap.use_eip1559 {
        let mut tx = Eip1559TransactionRequest::new()
            .from(from)
            .to(token)
            .data(Bytes::from(data))
            .nonce(nonce)
            .chain_id(network.chain_id())
            .gas(gas_limit);
        tx.max_fee_per_gas = snap.max_fee_per_gas;
        tx.max_priority_fee_per_gas = snap.priority_fee;
        TypedTransaction::Eip1559(tx)
    } else {
        let mut tx = TransactionRequest::new()
            .from(from)
            .to(token)
            .data(Bytes::from(data))
            .nonce(nonce)
            .chain_id(network.chain_id())
            .gas(gas_limit);
        tx.gas_price = snap.gas_price;
        TypedTransaction::Legacy(tx)
    }
}

/// Sign with a supplied private key; fails if the key's derived address does
/// not match the declared sender. The key is zeroized and never logged.
pub fn sign_transfer(tx: &TypedTransaction, private_key: &str) -> Result<Bytes, ChainError> {
    let key = Zeroizing::new(private_key.trim_start_matches("0x").to_string());
    let wallet: LocalWallet = key.parse().map_err(|_| ChainError::InvalidKey)?;

    let declared = match tx.from() {
        Some(a) => *a,
        None => return Err(ChainError::Signing("transaction has no sender".into())),
    };
    // H160 comparison is canonical, so mixed-case hex inputs need no
    // explicit case folding
    if wallet.address() != declared {
        return Err(ChainError::AddressMismatch {
            derived: format!("{:?}", wallet.address()),
            declared: format!("{:?}", declared),
        });
    }

    let chain_id = tx.chain_id().map(|v| v.as_u64()).unwrap_or(1);
    let wallet = wallet.with_chain_id(chain_id);
    let sig = wallet.sign_transaction_sync(tx).map_err(|e| ChainError::Signing(e.to_string()))?;
    Ok(tx.rlp_signed(&sig))
}

pub struct EvmClient {
    network: Network,
    provider: Provider<Http>,
    gas_cache: GasCache,
    max_retries: usize,
    cooldown: Duration,
}

impl EvmClient {
    pub fn new(network: Network, api_key: &str) -> Result<Self, ChainError> {
        let url = url::Url::parse(&network.rpc_url(api_key))
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        let provider = Provider::new(Http::new_with_client(url, http));
        info!(network = %network.name(), chain_id = network.chain_id(), "EVM client initialized");
        Ok(Self {
            network,
            provider,
            gas_cache: GasCache::new(GAS_CACHE_TTL),
            max_retries: GAS_FETCH_MAX_RETRIES,
            cooldown: GAS_FETCH_COOLDOWN,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub async fn get_account_data(&self, address: Address) -> Result<AccountSnapshot, ChainError> {
        // "pending" nonce includes in-flight transactions
        let nonce = self
            .provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await?;
        let balance = self.provider.get_balance(address, None).await?;
        info!(address = ?address, nonce = %nonce, balance = %balance, "account data fetched");
        Ok(AccountSnapshot { nonce, balance, address })
    }

    /// Cached gas pricing. On cache miss: up to `max_retries` fetch attempts
    /// with a fixed cooldown, then fatal.
    pub async fn gas_pricing(&self) -> Result<GasSnapshot, ChainError> {
        if let Some(snap) = self.gas_cache.get_fresh().await {
            GAS_CACHE.with_label_values(&["hit"]).inc();
            return Ok(snap);
        }
        GAS_CACHE.with_label_values(&["miss"]).inc();

        let mut last = String::new();
        for attempt in 1..=self.max_retries {
            match self.fetch_gas_snapshot().await {
                Ok(snap) => {
                    info!(
                        network = %self.network.name(),
                        block = snap.block_number,
                        eip1559 = snap.use_eip1559,
                        "gas pricing data fetched"
                    );
                    self.gas_cache.store(snap.clone()).await;
                    return Ok(snap);
                }
                Err(e) => {
                    warn!(attempt, max = self.max_retries, error = %e, "gas pricing fetch failed");
                    last = e.to_string();
                    if attempt < self.max_retries {
                        GAS_FETCH_RETRIES.inc();
                        sleep(self.cooldown).await;
                    }
                }
            }
        }
        Err(ChainError::GasPricing { attempts: self.max_retries, last })
    }

    async fn fetch_gas_snapshot(&self) -> Result<GasSnapshot, ChainError> {
        let block = self
            .provider
            .get_block(BlockNumber::Latest)
            .await?
            .ok_or_else(|| ChainError::Transport("latest block unavailable".into()))?;
        let block_number = block.number.map(|n| n.as_u64()).unwrap_or_default();

        match block.base_fee_per_gas {
            Some(base) => {
                // Fee-market network
                let priority: U256 =
                    self.provider.request("eth_maxPriorityFeePerGas", ()).await?;
                Ok(GasSnapshot {
                    block_number,
                    base_fee: Some(base),
                    use_eip1559: true,
                    priority_fee: Some(priority),
                    max_fee_per_gas: Some(base * U256::from(2u64) + priority),
                    gas_price: None,
                    fetched_at: Instant::now(),
                })
            }
            None => {
                // Legacy network
                let gas_price = self.provider.get_gas_price().await?;
                Ok(GasSnapshot {
                    block_number,
                    base_fee: None,
                    use_eip1559: false,
                    priority_fee: None,
                    max_fee_per_gas: None,
                    gas_price: Some(gas_price),
                    fetched_at: Instant::now(),
                })
            }
        }
    }

    /// ERC-20 balanceOf via eth_call.
    pub async fn get_token_balance(
        &self,
        wallet_address: Address,
        token_address: Address,
    ) -> Result<U256, ChainError> {
        let data = erc20_balance_of_calldata(wallet_address);
        let tx: TypedTransaction =
            TransactionRequest::new().to(token_address).data(Bytes::from(data)).into();
        let out = self.provider.call(&tx, None).await?;
        Ok(U256::from_big_endian(&out))
    }

    /// Build, sign and broadcast a memo-tagged token transfer. Returns the
    /// transaction hash without waiting for confirmation.
    pub async fn send_token_with_memo(
        &self,
        token_address: &str,
        recipient_address: &str,
        amount: U256,
        memo_text: &str,
        private_key: &str,
    ) -> Result<H256, ChainError> {
        let token = parse_address(token_address)?;
        let recipient = parse_address(recipient_address)?;

        // Derive the sender before touching the network
        let key = Zeroizing::new(private_key.trim_start_matches("0x").to_string());
        let wallet: LocalWallet = key.parse().map_err(|_| ChainError::InvalidKey)?;
        let from = wallet.address();

        info!(
            network = %self.network.name(),
            recipient = ?recipient,
            amount = %amount,
            "starting token transfer with memo"
        );

        let account = self.get_account_data(from).await?;
        let gas = self.gas_pricing().await?;

        // Nothing to pay gas with -> fail before building anything.
        // BNB skips this guard (kept quirk, see DESIGN.md).
        if account.balance.is_zero() && !self.network.skips_zero_balance_guard() {
            return Err(ChainError::InsufficientGasFunds {
                currency: self.network.native_currency(),
            });
        }

        let data = append_memo(erc20_transfer_calldata(recipient, amount), memo_text);

        // Estimate against the real call, memo included; failure is not fatal
        let probe: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(token)
            .data(Bytes::from(data.clone()))
            .into();
        let gas_limit = match self.provider.estimate_gas(&probe, None).await {
            Ok(est) => {
                let limit = buffered_gas_limit(self.network, est);
                info!(estimate = %est, limit = %limit, "gas estimated");
                limit
            }
            Err(e) => {
                let limit = U256::from(self.network.fallback_gas_limit());
                warn!(error = %e, limit = %limit, "gas estimation failed, using fallback limit");
                limit
            }
        };

        let tx = build_transfer_tx(self.network, from, token, data, account.nonce, gas_limit, &gas);
        let raw = sign_transfer(&tx, private_key)?;

        info!("transaction signed, sending to network");
        let pending = self.provider.send_raw_transaction(raw).await?;
        let hash = *pending;
        info!(network = %self.network.name(), tx = ?hash, "transaction sent");
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eip1559_snapshot(base: u64, priority: u64) -> GasSnapshot {
        GasSnapshot {
            block_number: 100,
            base_fee: Some(U256::from(base)),
            use_eip1559: true,
            priority_fee: Some(U256::from(priority)),
            max_fee_per_gas: Some(U256::from(base * 2 + priority)),
            gas_price: None,
            fetched_at: Instant::now(),
        }
    }

    fn legacy_snapshot(gas_price: u64) -> GasSnapshot {
        GasSnapshot {
            block_number: 100,
            base_fee: None,
            use_eip1559: false,
            priority_fee: None,
            max_fee_per_gas: None,
            gas_price: Some(U256::from(gas_price)),
            fetched_at: Instant::now(),
        }
    }

    #[test]
    fn transfer_calldata_layout() {
        let recipient: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        let data = erc20_transfer_calldata(recipient, U256::from(1000u64));
        let hexed = hex::encode(&data);
        assert!(hexed.starts_with("a9059cbb"));
        // 32-byte padded recipient, then 32-byte padded amount (0x3e8)
        assert_eq!(
            hexed,
            format!(
                "a9059cbb{:0>64}{:0>64}",
                "1111111111111111111111111111111111111111", "3e8"
            )
        );
        assert_eq!(data.len(), 4 + 32 + 32);
    }

    #[test]
    fn memo_rides_after_calldata() {
        let recipient: Address = "0x2222222222222222222222222222222222222222".parse().unwrap();
        let base = erc20_transfer_calldata(recipient, U256::from(1u64));
        let memo = r#"{"type":"LIMIT"}"#;
        let data = append_memo(base.clone(), memo);
        assert_eq!(&data[..base.len()], &base[..]);
        assert_eq!(&data[base.len()..], memo.as_bytes());
    }

    #[test]
    fn gas_buffers_per_network() {
        let est = U256::from(100_000u64);
        assert_eq!(buffered_gas_limit(Network::Ethereum, est), U256::from(125_000u64));
        assert_eq!(buffered_gas_limit(Network::Arbitrum, est), U256::from(140_000u64));
        assert_eq!(buffered_gas_limit(Network::Base, est), U256::from(135_000u64));
        assert_eq!(buffered_gas_limit(Network::Bnb, est), U256::from(120_000u64));
    }

    #[test]
    fn fallback_gas_limits() {
        assert_eq!(Network::Arbitrum.fallback_gas_limit(), 150_000);
        assert_eq!(Network::Base.fallback_gas_limit(), 150_000);
        assert_eq!(Network::Ethereum.fallback_gas_limit(), 100_000);
        assert_eq!(Network::Bnb.fallback_gas_limit(), 100_000);
    }

    #[test]
    fn fee_fields_are_mutually_exclusive() {
        let from: Address = "0x3333333333333333333333333333333333333333".parse().unwrap();
        let token: Address = "0x4444444444444444444444444444444444444444".parse().unwrap();

        let snap = eip1559_snapshot(10, 2);
        let tx = build_transfer_tx(
            Network::Arbitrum,
            from,
            token,
            vec![0u8; 4],
            U256::from(7u64),
            U256::from(150_000u64),
            &snap,
        );
        match tx {
            TypedTransaction::Eip1559(t) => {
                assert_eq!(t.max_fee_per_gas, Some(U256::from(22u64)));
                assert_eq!(t.max_priority_fee_per_gas, Some(U256::from(2u64)));
                assert_eq!(t.nonce, Some(U256::from(7u64)));
            }
            other => panic!("expected EIP-1559 tx, got {:?}", other),
        }

        let snap = legacy_snapshot(5);
        let tx = build_transfer_tx(
            Network::Bnb,
            from,
            token,
            vec![0u8; 4],
            U256::from(1u64),
            U256::from(100_000u64),
            &snap,
        );
        match tx {
            TypedTransaction::Legacy(t) => {
                assert_eq!(t.gas_price, Some(U256::from(5u64)));
            }
            other => panic!("expected legacy tx, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn gas_cache_honors_ttl() {
        let cache = GasCache::new(Duration::from_millis(50));
        assert!(cache.get_fresh().await.is_none());

        cache.store(legacy_snapshot(9)).await;
        let hit = cache.get_fresh().await.expect("fresh snapshot");
        assert_eq!(hit.gas_price, Some(U256::from(9u64)));

        sleep(Duration::from_millis(70)).await;
        assert!(cache.get_fresh().await.is_none(), "expired snapshot must not be reused");
    }

    // Well-known throwaway dev key (hardhat account #0)
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TEST_ADDR: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    fn legacy_tx(from: Address) -> TypedTransaction {
        let mut tx = TransactionRequest::new()
            .from(from)
            .to("0x5555555555555555555555555555555555555555".parse::<Address>().unwrap())
            .nonce(U256::zero())
            .chain_id(1u64)
            .gas(U256::from(21_000u64));
        tx.gas_price = Some(U256::from(1_000_000_000u64));
        TypedTransaction::Legacy(tx)
    }

    #[test]
    fn signing_verifies_sender_address() {
        let good: Address = TEST_ADDR.parse().unwrap();
        let raw = sign_transfer(&legacy_tx(good), TEST_KEY).unwrap();
        assert!(!raw.is_empty());

        let wrong: Address = "0x6666666666666666666666666666666666666666".parse().unwrap();
        match sign_transfer(&legacy_tx(wrong), TEST_KEY) {
            Err(ChainError::AddressMismatch { derived, declared }) => {
                assert_eq!(derived.to_lowercase(), TEST_ADDR);
                assert!(declared.to_lowercase().contains("6666"));
            }
            other => panic!("expected AddressMismatch, got {:?}", other),
        }
    }

    #[test]
    fn mismatch_error_never_echoes_key() {
        let wrong: Address = "0x6666666666666666666666666666666666666666".parse().unwrap();
        let err = sign_transfer(&legacy_tx(wrong), TEST_KEY).unwrap_err();
        let msg = err.to_string();
        assert!(!msg.contains(&TEST_KEY[2..10]), "error text must not leak key material");
    }

    #[test]
    fn balance_of_calldata_layout() {
        let owner: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        let data = erc20_balance_of_calldata(owner);
        let hexed = hex::encode(&data);
        assert!(hexed.starts_with("70a08231"));
        assert_eq!(data.len(), 4 + 32);
    }
}
