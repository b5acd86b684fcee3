// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use ethers::prelude::*;
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use arka_erc20::codec;
use arka_erc20::contracts::IEntryPoint;
use arka_erc20::converter::{CostConverter, ExchangeRate};
use arka_erc20::coordinator::EntryPointCoordinator;
use arka_erc20::factory::{CallIntent, GasHints, UserOperationFactory};
use arka_erc20::ledger::PaymasterLedger;
use arka_erc20::paymaster::{unix_now, DepositSource, Paymaster};
use arka_erc20::relay::{HttpBundler, RelayClient, RelayOutcome};
use arka_erc20::rpc::{PaymasterRpcImpl, PaymasterRpcServer};
use arka_erc20::signer::{Eip191Scheme, OperationHasher, OperationSigner};
use arka_erc20::token::Erc20Contracts;
use arka_erc20::types::SponsorData;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, env = "PRIVATE_KEY", hide_env_values = true)]
    private_key: String,

    #[clap(long, env = "CHAIN_ID")]
    chain_id: u64,

    #[clap(long, env = "ETH_RPC_URL")]
    eth_rpc_url: String,

    #[clap(long, env = "ENTRY_POINT")]
    entry_point: Address,

    /// Sponsor (paymaster contract) address
    #[clap(long, env = "PAYMASTER")]
    paymaster: Address,

    /// Accepted token and its rate, `<address>=<rate>`; rate is `N` or `N/D`
    #[clap(long = "token", value_parser = parse_token_rate)]
    tokens: Vec<(Address, ExchangeRate)>,

    /// Emit logs as JSON
    #[clap(long, env = "LOG_JSON")]
    log_json: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the `pm` JSON-RPC sponsor service
    Serve {
        #[clap(long, default_value = "127.0.0.1:3001")]
        rpc_server_addr: String,

        /// Seconds a sponsorship stays valid
        #[clap(long, default_value_t = 3600)]
        valid_duration: u64,
    },
    /// Build, sponsor, sign and submit a call from a wallet
    Send {
        #[clap(flatten)]
        wallet: WalletArgs,

        #[clap(long)]
        target: Address,

        /// Value in wei
        #[clap(long, default_value = "0", value_parser = parse_dec_u256)]
        value: U256,

        /// Hex calldata for the target
        #[clap(long, default_value = "0x", value_parser = parse_hex_bytes)]
        data: Bytes,
    },
    /// Approve the paymaster to pull the settlement token from the wallet
    Approve {
        #[clap(flatten)]
        wallet: WalletArgs,

        /// Token amount in base units, unlimited if omitted
        #[clap(long, value_parser = parse_dec_u256)]
        amount: Option<U256>,
    },
}

#[derive(clap::Args, Debug)]
struct WalletArgs {
    /// Smart-contract wallet address
    #[clap(long)]
    sender: Address,

    /// Settlement token
    #[clap(long)]
    pay_with: Address,

    #[clap(long, env = "BUNDLER_URL")]
    bundler_url: String,

    #[clap(long, default_value_t = 30)]
    timeout_secs: u64,
}

fn parse_token_rate(s: &str) -> Result<(Address, ExchangeRate), String> {
    let (token, rate) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <address>=<rate>, got {s:?}"))?;
    let token = token.parse::<Address>().map_err(|e| e.to_string())?;
    let rate = rate.parse::<ExchangeRate>().map_err(|e| e.to_string())?;
    Ok((token, rate))
}

fn parse_dec_u256(s: &str) -> Result<U256, String> {
    U256::from_dec_str(s).map_err(|e| e.to_string())
}

fn parse_hex_bytes(s: &str) -> Result<Bytes, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(digits).map(Bytes::from).map_err(|e| e.to_string())
}

fn configure_logging(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder().with_env_filter(filter);
    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();
    configure_logging(args.log_json)?;

    let owner_key = args
        .private_key
        .parse::<LocalWallet>()
        .context("private key should parse")?
        .with_chain_id(args.chain_id);
    let provider = Provider::<Http>::try_from(args.eth_rpc_url.as_str())?;
    let client = Arc::new(SignerMiddleware::new(provider, owner_key.clone()));

    let hasher = OperationHasher::new(args.entry_point, args.chain_id);
    let mut converter = CostConverter::new();
    for (token, rate) in &args.tokens {
        converter.add_token(*token, *rate);
    }
    let ledger = Arc::new(PaymasterLedger::new(
        args.paymaster,
        hasher,
        converter,
        Arc::new(Erc20Contracts::new(Arc::clone(&client))),
    ));
    let entry_point = IEntryPoint::new(args.entry_point, Arc::clone(&client));

    let (intent, wallet_args) = match args.command {
        Command::Serve {
            rpc_server_addr,
            valid_duration,
        } => {
            let paymaster = Paymaster::new(ledger, Arc::new(entry_point), valid_duration);
            let server_addr: SocketAddr = rpc_server_addr.parse()?;
            info!("Starting ERC-20 paymaster RPC server on {}", server_addr);

            let rpc = PaymasterRpcImpl::new(Arc::new(paymaster));
            let server_handle = start_server(server_addr, rpc).await?;
            tokio::signal::ctrl_c().await?;
            server_handle.stop()?;
            info!("Server stopped");
            return Ok(());
        }
        Command::Send {
            wallet,
            target,
            value,
            data,
        } => {
            let intent = CallIntent {
                sender: wallet.sender,
                target,
                value,
                data,
            };
            (intent, wallet)
        }
        Command::Approve { wallet, amount } => {
            let intent = CallIntent::erc20_approve(
                wallet.sender,
                wallet.pay_with,
                args.paymaster,
                amount.unwrap_or(U256::MAX),
            );
            (intent, wallet)
        }
    };

    let session = WalletSession {
        owner: owner_key,
        paymaster: args.paymaster,
        chain_id: args.chain_id,
        hasher,
        ledger,
        entry_point,
    };
    session.submit(intent, &wallet_args).await
}

async fn start_server(
    server_addr: SocketAddr,
    paymaster_rpc: PaymasterRpcImpl,
) -> anyhow::Result<ServerHandle> {
    let server = ServerBuilder::default().build(server_addr).await?;
    Ok(server.start(paymaster_rpc.into_rpc()))
}

/// Drives one wallet call from construction to bundler submission.
struct WalletSession<M> {
    owner: LocalWallet,
    paymaster: Address,
    chain_id: u64,
    hasher: OperationHasher,
    ledger: Arc<PaymasterLedger>,
    entry_point: IEntryPoint<M>,
}

impl<M: Middleware + 'static> WalletSession<M> {
    async fn submit(self, intent: CallIntent, wallet: &WalletArgs) -> anyhow::Result<()> {
        let sender = wallet.sender;
        let timeout = Duration::from_secs(wallet.timeout_secs);
        let nonce = self.entry_point.get_nonce(sender, U256::zero()).call().await?;

        let factory = UserOperationFactory::new();
        factory.observe_nonce(sender, nonce);
        let sponsor_data = SponsorData {
            paymaster: self.paymaster,
            token: wallet.pay_with,
            window: None,
        };
        let op = factory
            .create(intent, nonce, GasHints::default())?
            .with_sponsor_data(codec::encode(&sponsor_data));

        let owner = self.owner.address();
        let signer = OperationSigner::new(self.owner, Eip191Scheme, self.hasher);
        let op = signer.sign(op).await?;

        self.ledger
            .set_deposit(self.entry_point.deposit_of(self.paymaster).await?);
        let coordinator = EntryPointCoordinator::relay_only(self.hasher);
        coordinator.register_account(sender, owner, Arc::new(Eip191Scheme));
        coordinator.register_ledger(self.ledger);
        coordinator.observe_nonce(sender, nonce);

        let context = coordinator.preflight(&op, unix_now()?).await?;
        info!(
            "Operation {:?} costs at most {} of {:?}",
            context.op_hash, context.max_token_cost, wallet.pay_with
        );

        let bundler = HttpBundler::connect(&wallet.bundler_url, self.chain_id, timeout).await?;
        let relay = RelayClient::new(Arc::new(bundler), self.entry_point.address(), self.chain_id);
        match relay.submit(&op, timeout).await? {
            RelayOutcome::Accepted(handle) => {
                coordinator.record_submitted(context.op_hash)?;
                info!("Submitted user operation {:?}", handle);
                Ok(())
            }
            RelayOutcome::RejectedByRelay(reason) => bail!("bundler rejected operation: {reason}"),
        }
    }
}
