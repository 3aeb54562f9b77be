//! Raw connection attempts for port readiness

use crate::error::{CorralError, CorralResult};
use crate::service::{NetworkProtocol, Port};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};

/// Connect once to `port` on `address` from the current network namespace
///
/// A connect that succeeds counts even if the peer closes it right away.
pub(crate) async fn dial_address(
    address: &str,
    port: &Port,
    timeout: Duration,
) -> CorralResult<()> {
    let target = (address, port.port);
    let attempt = async {
        match port.protocol {
            NetworkProtocol::Tcp => TcpStream::connect(target).await.map(drop),
            NetworkProtocol::Udp => {
                let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
                socket.connect(target).await
            }
        }
    };

    let reason = match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("dial timed out after {:?}", timeout),
    };
    Err(CorralError::PortNotReady {
        target: format!("{}:{}", address, port),
        reason,
    })
}
