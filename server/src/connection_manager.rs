use std::io::ErrorKind;

use anyhow::{bail, Context};
use common::network::{Connection, ErrorReply, Packet, Request, Response};
use common::Principal;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::engine::BettingEngine;
use crate::error::LedgerError;

pub async fn listen(addr: &str, engine: BettingEngine) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr, "accepting connections");
    serve(listener, engine).await
}

pub async fn serve(listener: TcpListener, engine: BettingEngine) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();

        tokio::spawn(async move {
            let connection = match Connection::from_tcp_stream(stream).await {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(%peer, %err, "websocket handshake failed");
                    return;
                }
            };
            if let Err(err) = handle_connection(connection, engine).await {
                warn!(%peer, %err, "connection dropped");
            }
        });
    }
}

async fn handle_connection(mut connection: Connection, engine: BettingEngine) -> anyhow::Result<()> {
    let Some(principal) = handle_login(&mut connection, &engine).await? else {
        return Ok(());
    };
    debug!(user_id = %principal.user_id, role = %principal.role, "session opened");
    handle_client(principal, &mut connection, engine).await
}

/// The first packet has to be a login. Anything else ends the session.
async fn handle_login(connection: &mut Connection, engine: &BettingEngine) -> anyhow::Result<Option<Principal>> {
    let packet = connection.read().await?;
    let Packet::RequestPacket(Request::Login { user_id }) = packet else {
        connection
            .send(error_reply(&LedgerError::Forbidden("login required".to_string())))
            .await?;
        return Ok(None);
    };

    let login = async {
        let principal = engine.resolve_principal(&user_id).await?;
        let wallet = engine.wallet(&principal).await?;
        Ok::<_, LedgerError>((principal, wallet))
    };
    match login.await {
        Ok((principal, wallet)) => {
            connection
                .send(Packet::ResponsePacket(Response::SuccessfulLogin {
                    principal: principal.clone(),
                    wallet,
                }))
                .await?;
            Ok(Some(principal))
        }
        Err(err) => {
            connection.send(error_reply(&err)).await?;
            Ok(None)
        }
    }
}

async fn handle_client(
    principal: Principal,
    connection: &mut Connection,
    engine: BettingEngine,
) -> anyhow::Result<()> {
    loop {
        let packet = match connection.read().await {
            Ok(packet) => packet,
            Err(error) => {
                return match error.downcast_ref::<std::io::Error>().map(|err| err.kind()) {
                    //connection aborted is considered successful
                    Some(ErrorKind::ConnectionAborted) => Ok(()),
                    _ => Err(error),
                };
            }
        };

        let request = match packet {
            Packet::RequestPacket(request) => request,
            other => bail!("incorrect packet type: {:?}", other),
        };
        if let Request::Login { .. } = request {
            connection
                .send(error_reply(&LedgerError::Forbidden("already logged in".to_string())))
                .await?;
            bail!("Attempted re-login - denied");
        }

        let reply = match dispatch(&engine, &principal, request).await {
            Ok(response) => Packet::ResponsePacket(response),
            Err(err) => error_reply(&err),
        };
        connection.send(reply).await?;
    }
}

async fn dispatch(engine: &BettingEngine, principal: &Principal, request: Request) -> Result<Response, LedgerError> {
    let response = match request {
        Request::Login { .. } => return Err(LedgerError::Forbidden("already logged in".to_string())),
        Request::WhoAmI => Response::WhoAmI(principal.clone()),
        Request::Wallet => Response::Wallet(engine.wallet(principal).await?),
        Request::Transactions { filter, page } => {
            Response::Transactions(engine.transactions(principal, filter, page).await?)
        }
        Request::Matches { status } => Response::Matches(engine.list_matches(status).await?),
        Request::MyBets => Response::Bets(engine.my_bets(principal).await?),
        Request::Bets { filter, page } => Response::BetPage(engine.list_bets(principal, filter, page).await?),
        Request::PlaceBet {
            match_id,
            side,
            stake,
        } => {
            let (bet, wallet) = engine.place_bet(principal, &match_id, &side, &stake).await?;
            Response::BetPlaced { bet, wallet }
        }
        Request::CancelBet { bet_id } => Response::Wallet(engine.cancel_bet(principal, &bet_id).await?),
        Request::SetMatchStatus { match_id, status } => {
            Response::Match(engine.set_match_status(principal, &match_id, status).await?)
        }
        Request::DeclareResult { match_id, result } => {
            Response::Settled(engine.declare_result(principal, &match_id, &result).await?)
        }
        Request::CancelMatch { match_id } => Response::Refunded(engine.cancel_match(principal, &match_id).await?),
        Request::AdminCredit { user_id, amount, note } => {
            Response::Wallet(engine.admin_credit(principal, &user_id, amount, note).await?)
        }
        Request::AdminDebit { user_id, amount, note } => {
            Response::Wallet(engine.admin_debit(principal, &user_id, amount, note).await?)
        }
        Request::Stats => Response::Stats(engine.dashboard_stats(principal).await?),
    };
    Ok(response)
}

fn error_reply(error: &LedgerError) -> Packet {
    Packet::Error(ErrorReply {
        kind: error.kind(),
        message: error.to_string(),
    })
}
