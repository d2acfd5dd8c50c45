
mod admin;
mod inbound_discord;
mod outbound;
mod system;
mod whatsapp_queue;
