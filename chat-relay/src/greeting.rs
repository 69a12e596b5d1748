use crate::message::ServerToClient;

/// Answers a join request. Every display name is accepted.
pub fn greet(display_name: &str) -> ServerToClient {
    ServerToClient::Joined {
        success: true,
        message: format!("Welcome to {display_name} in Chat Room."),
    }
}
