use std::io::ErrorKind as IoErrorKind;

use anyhow::bail;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{
    Bet, BetFilter, DashboardStats, ErrorKind, Match, MatchStatus, Page, PageRequest, Principal,
    RefundSummary, SettlementSummary, Transaction, TransactionFilter, WalletSnapshot,
};

#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub enum Request {
    Login { user_id: String }, // SuccessfulLogin response
    WhoAmI,
    Wallet,
    Transactions { filter: TransactionFilter, page: PageRequest },
    Matches { status: Option<MatchStatus> },
    MyBets,
    Bets { filter: BetFilter, page: PageRequest },
    PlaceBet { match_id: String, side: String, stake: String },
    CancelBet { bet_id: String },
    SetMatchStatus { match_id: String, status: MatchStatus }, // Match response
    DeclareResult { match_id: String, result: String },
    CancelMatch { match_id: String },
    AdminCredit { user_id: String, amount: Decimal, note: Option<String> }, // Wallet response
    AdminDebit { user_id: String, amount: Decimal, note: Option<String> }, // Wallet response
    Stats,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub enum Response {
    None,
    SuccessfulLogin { principal: Principal, wallet: WalletSnapshot },
    WhoAmI(Principal),
    Wallet(WalletSnapshot),
    Transactions(Page<Transaction>),
    Matches(Vec<Match>),
    Match(Match),
    Bets(Vec<Bet>),
    BetPage(Page<Bet>),
    BetPlaced { bet: Bet, wallet: WalletSnapshot },
    Settled(SettlementSummary),
    Refunded(RefundSummary),
    Stats(DashboardStats),
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    RequestPacket(Request),
    ResponsePacket(Response),
    Error(ErrorReply),
}

/// A websocket carrying MessagePack encoded packets.
pub struct Connection<S = TcpStream> {
    socket: WebSocketStream<S>,
}

impl Connection<TcpStream> {
    pub async fn from_tcp_stream(connection: TcpStream) -> anyhow::Result<Self> {
        let socket = tokio_tungstenite::accept_async(connection).await?;
        Ok(Self { socket })
    }
}

impl Connection<MaybeTlsStream<TcpStream>> {
    pub async fn connect(address: &str) -> anyhow::Result<Self> {
        let (socket, _) = tokio_tungstenite::connect_async(address).await?;
        Ok(Self { socket })
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads the next packet. A closed socket surfaces as an
    /// `io::ErrorKind::ConnectionAborted` error.
    pub async fn read(&mut self) -> anyhow::Result<Packet> {
        loop {
            let message = match self.socket.next().await {
                Some(message) => message?,
                None => return Err(connection_closed()),
            };
            match message {
                Message::Binary(data) => return Ok(rmp_serde::from_slice(&data)?),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => return Err(connection_closed()),
                _ => bail!("incorrect data type received"),
            }
        }
    }

    pub async fn send(&mut self, data: Packet) -> anyhow::Result<()> {
        let encoded = rmp_serde::to_vec(&data)?;
        Ok(self.socket.send(Message::Binary(encoded)).await?)
    }

    /// Sends a request and waits for the matching reply.
    pub async fn request(&mut self, request: Request) -> anyhow::Result<Packet> {
        self.send(Packet::RequestPacket(request)).await?;
        self.read().await
    }

    pub async fn close(mut self) -> anyhow::Result<()> {
        Ok(self.socket.close(None).await?)
    }
}

fn connection_closed() -> anyhow::Error {
    std::io::Error::new(IoErrorKind::ConnectionAborted, "connection closed").into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn packets_survive_messagepack() {
        let packets = [
            Packet::RequestPacket(Request::PlaceBet {
                match_id: "m1".into(),
                side: "IND".into(),
                stake: "40".into(),
            }),
            Packet::ResponsePacket(Response::Wallet(WalletSnapshot {
                balance: dec!(60),
                exposure: dec!(40),
            })),
            Packet::Error(ErrorReply {
                kind: ErrorKind::Funds,
                message: "insufficient funds".into(),
            }),
        ];
        for packet in packets {
            let bytes = rmp_serde::to_vec(&packet).unwrap();
            assert_eq!(rmp_serde::from_slice::<Packet>(&bytes).unwrap(), packet);
        }
    }
}
