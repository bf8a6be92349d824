use anyhow::{anyhow, bail, Result};
use argh::FromArgs;
use ecrlink_terminal::{
    DefaultPolicy, Event, FileStore, RecordStore, TerminalConfig, TerminalManager,
};
use env_logger::{Builder, Env};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum SubCommands {
    Test(TestArgs),
    Pay(PayArgs),
    Refund(RefundArgs),
    Reversal(ReversalArgs),
    Retrieve(RetrieveArgs),
    Last(LastArgs),
    Abort(AbortArgs),
    Status(StatusArgs),
    Version(VersionArgs),
    Tcs(TcsArgs),
    Display(DisplayArgs),
    ClearDisplay(ClearDisplayArgs),
    BonusMode(BonusModeArgs),
    BonusInfo(BonusInfoArgs),
    AuxMode(AuxModeArgs),
    Accept(AcceptArgs),
    Reject(RejectArgs),
}

#[derive(FromArgs, PartialEq, Debug)]
/// Sends the ENQ handshake.
#[argh(subcommand, name = "test")]
struct TestArgs {}

#[derive(FromArgs, PartialEq, Debug)]
/// Runs a payment.
#[argh(subcommand, name = "pay")]
struct PayArgs {
    /// amount in minor currency units (e.g. cents).
    #[argh(positional)]
    amount: u64,

    /// mark the bonus card as already handled.
    #[argh(switch)]
    bonus_handled: bool,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Runs a refund.
#[argh(subcommand, name = "refund")]
struct RefundArgs {
    /// amount in minor currency units.
    #[argh(positional)]
    amount: u64,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Reverses an earlier transaction.
#[argh(subcommand, name = "reversal")]
struct ReversalArgs {
    /// the 5-digit transaction id.
    #[argh(positional)]
    transaction_id: String,

    /// the original timestamp, yyMMddHHmmss.
    #[argh(positional)]
    timestamp: String,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Retrieves an earlier transaction.
#[argh(subcommand, name = "retrieve")]
struct RetrieveArgs {
    /// the 5-digit transaction id.
    #[argh(positional)]
    transaction_id: String,

    /// the original timestamp, yyMMddHHmmss.
    #[argh(positional)]
    timestamp: String,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Retrieves the last transaction.
#[argh(subcommand, name = "last")]
struct LastArgs {}

#[derive(FromArgs, PartialEq, Debug)]
/// Aborts the running transaction.
#[argh(subcommand, name = "abort")]
struct AbortArgs {}

#[derive(FromArgs, PartialEq, Debug)]
/// Queries the terminal status.
#[argh(subcommand, name = "status")]
struct StatusArgs {}

#[derive(FromArgs, PartialEq, Debug)]
/// Queries the terminal version.
#[argh(subcommand, name = "version")]
struct VersionArgs {}

#[derive(FromArgs, PartialEq, Debug)]
/// Retrieves the pending control-system (TCS) message.
#[argh(subcommand, name = "tcs")]
struct TcsArgs {}

#[derive(FromArgs, PartialEq, Debug)]
/// Shows up to two lines of text on the terminal display.
#[argh(subcommand, name = "display")]
struct DisplayArgs {
    /// first display line, at most 21 characters.
    #[argh(positional)]
    line1: String,

    /// second display line.
    #[argh(positional, default = "String::new()")]
    line2: String,

    /// use the big font.
    #[argh(switch)]
    big: bool,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Clears the terminal display.
#[argh(subcommand, name = "clear_display")]
struct ClearDisplayArgs {}

#[derive(FromArgs, PartialEq, Debug)]
/// Switches bonus-card mode on or off.
#[argh(subcommand, name = "bonus_mode")]
struct BonusModeArgs {
    /// enable the mode; omit to disable it.
    #[argh(switch)]
    enable: bool,

    /// let the terminal answer customer requests itself.
    #[argh(switch)]
    auto_reply: bool,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Requests the bonus-card data of the presented card.
#[argh(subcommand, name = "bonus_info")]
struct BonusInfoArgs {
    /// leave customer-request mode afterwards.
    #[argh(switch)]
    stop_active: bool,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Switches the auxiliary accept mode on or off.
#[argh(subcommand, name = "aux_mode")]
struct AuxModeArgs {
    /// enable the mode; omit to disable it.
    #[argh(switch)]
    enable: bool,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Accepts a paused transaction.
#[argh(subcommand, name = "accept")]
struct AcceptArgs {
    /// the 5-digit transaction id.
    #[argh(positional)]
    transaction_id: String,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Rejects a paused transaction.
#[argh(subcommand, name = "reject")]
struct RejectArgs {
    /// the 5-digit transaction id.
    #[argh(positional)]
    transaction_id: String,
}

#[derive(FromArgs, Debug)]
/// Drive a payment terminal over its serial ECR interface.
struct Args {
    /// serial device of the terminal, e.g. /dev/ttyUSB0 or COM3.
    #[argh(option)]
    port: String,

    /// currency code. Defaults to EUR.
    #[argh(option, default = "\"EUR\".to_string()")]
    currency: String,

    /// number of this register.
    #[argh(option, default = "1")]
    ecr_number: u16,

    /// directory to archive completed transactions in.
    #[argh(option)]
    archive_dir: Option<String>,

    /// seconds to keep listening for terminal events.
    #[argh(option, default = "60")]
    wait: u64,

    #[argh(subcommand)]
    command: SubCommands,
}

/// What ends the event loop for the given command.
fn is_final(command: &SubCommands, event: &Event) -> bool {
    match command {
        SubCommands::Pay(_)
        | SubCommands::Refund(_)
        | SubCommands::Reversal(_)
        | SubCommands::Retrieve(_)
        | SubCommands::Last(_) => matches!(
            event,
            Event::Purchase(_)
                | Event::Refund(_)
                | Event::Reversal(_)
                | Event::Retrieve(_)
                | Event::Result(_)
                | Event::TerminalAbort { .. }
        ),
        SubCommands::Abort(_) => matches!(event, Event::AbortResult { .. }),
        SubCommands::Status(_) | SubCommands::Version(_) | SubCommands::Tcs(_) => {
            matches!(event, Event::DeviceStatus(_))
        }
        _ => matches!(event, Event::CommandAccepted { .. }),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .init();

    let args: Args = argh::from_env();
    let config: TerminalConfig = serde_json::from_value(serde_json::json!({
        "port": args.port,
        "currency": args.currency,
        "ecr_number": args.ecr_number,
    }))?;

    let store: Option<Arc<dyn RecordStore>> = args
        .archive_dir
        .as_ref()
        .map(|dir| Arc::new(FileStore::new(dir)) as Arc<dyn RecordStore>);
    let manager = TerminalManager::new(config, Arc::new(DefaultPolicy), store).await?;
    log::info!("terminal link open on {}", args.port);
    let mut events = manager
        .events()
        .ok_or_else(|| anyhow!("the event stream is taken exactly once"))?;

    match &args.command {
        SubCommands::Test(_) => manager.test_terminal(),
        SubCommands::Pay(pay) => manager.run_payment(pay.amount, pay.bonus_handled, None),
        SubCommands::Refund(refund) => manager.refund(refund.amount, None),
        SubCommands::Reversal(reversal) => {
            manager.reversal(&reversal.transaction_id, &reversal.timestamp, None)
        }
        SubCommands::Retrieve(retrieve) => {
            manager.retrieve_transaction(&retrieve.transaction_id, &retrieve.timestamp)
        }
        SubCommands::Last(_) => manager.retrieve_last_transaction(),
        SubCommands::Abort(_) => manager.abort_transaction(),
        SubCommands::Status(_) => manager.request_terminal_status(),
        SubCommands::Version(_) => manager.request_terminal_version(),
        SubCommands::Tcs(_) => manager.retrieve_tcs_message(),
        SubCommands::Display(display) => {
            manager.display_text(&display.line1, &display.line2, display.big)
        }
        SubCommands::ClearDisplay(_) => manager.clear_display_text(),
        SubCommands::BonusMode(mode) if mode.enable => {
            manager.enable_bonus_card_mode(mode.auto_reply)
        }
        SubCommands::BonusMode(_) => manager.disable_bonus_card_mode(),
        SubCommands::BonusInfo(info) => manager.request_bonus_card_info(info.stop_active),
        SubCommands::AuxMode(mode) if mode.enable => manager.enable_auxiliary_mode(),
        SubCommands::AuxMode(_) => manager.disable_auxiliary_mode(),
        SubCommands::Accept(accept) => manager.accept_transaction(&accept.transaction_id),
        SubCommands::Reject(reject) => manager.reject_transaction(&reject.transaction_id),
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.wait);
    loop {
        let event = match tokio::time::timeout_at(deadline, events.next()).await {
            Err(_) => bail!("no final answer from the terminal within {}s", args.wait),
            Ok(None) => bail!("event stream ended unexpectedly"),
            Ok(Some(event)) => event,
        };
        println!("{}", serde_json::to_string(&event)?);
        if let Event::Error(error) = &event {
            manager.disconnect().await;
            bail!("terminal error: {error:?}");
        }
        if is_final(&args.command, &event) {
            break;
        }
    }
    manager.disconnect().await;
    Ok(())
}
