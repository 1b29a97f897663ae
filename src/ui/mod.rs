//! Embeds de Discord para las respuestas de comandos.

pub mod embeds;
