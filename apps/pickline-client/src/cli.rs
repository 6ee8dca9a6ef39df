use clap::{Args, Parser, Subcommand, ValueEnum};
use pickline_core::{ItemAction, ItemId, MaterialId, OrderId, SessionId};

#[derive(Parser, Debug)]
#[command(name = "pickline-client")]
#[command(about = "Join a Pickline picking session from the terminal")]
pub struct Cli {
    /// Session server websocket URL
    #[arg(long, env = "PICKLINE_SERVER_URL", default_value = "ws://localhost:8080/ws")]
    pub server: String,

    #[command(flatten)]
    pub identity: Identity,

    /// Log filter used when `RUST_LOG` is unset
    #[arg(long, env = "PICKLINE_CLIENT_LOG", default_value = "warn")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Desktops join by session id; phones join with the pairing token.
#[derive(Args, Debug)]
pub struct Identity {
    /// Session to join as the desktop
    #[arg(long, env = "PICKLINE_SESSION_ID", required_unless_present = "token")]
    pub session: Option<SessionId>,

    /// Pairing token; joins as the mobile device
    #[arg(long, env = "PICKLINE_PAIRING_TOKEN")]
    pub token: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print a progress line for every session event until interrupted
    Watch,

    /// Change the picked quantity of an order item
    Pick {
        #[arg(long)]
        item: ItemId,

        #[arg(long, value_enum, default_value_t = PickAction::Increment)]
        action: PickAction,

        /// Repeat the action this many times
        #[arg(long, default_value_t = 1)]
        times: u32,
    },

    /// Mark a fully picked order as packed
    Pack {
        #[arg(long)]
        order: OrderId,

        #[arg(long)]
        material: Option<MaterialId>,

        /// Package weight in kilograms
        #[arg(long)]
        weight: Option<f64>,

        /// Notify the customer by email
        #[arg(long)]
        send_email: bool,
    },

    /// Move the session's current order
    Navigate {
        #[arg(long)]
        order: OrderId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PickAction {
    Increment,
    Decrement,
    PickAll,
}

impl From<PickAction> for ItemAction {
    fn from(action: PickAction) -> Self {
        match action {
            PickAction::Increment => ItemAction::Increment,
            PickAction::Decrement => ItemAction::Decrement,
            PickAction::PickAll => ItemAction::PickAll,
        }
    }
}
