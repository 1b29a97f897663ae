use serenity::model::id::ChannelId;

/// Estado observado al recibir un comando
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Invocation {
    pub in_guild: bool,
    /// Canal de voz del usuario
    pub user_voice: Option<ChannelId>,
    /// Canal de voz de la cola activa, si existe
    pub room_voice: Option<ChannelId>,
    pub playing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotInGuild,
    NotInVoice,
    DifferentVoiceChannel,
    NoActiveQueue,
    NothingPlaying,
}

impl Rejection {
    pub fn message(self) -> &'static str {
        match self {
            Rejection::NotInGuild => "❌ Este comando sólo funciona en un servidor",
            Rejection::NotInVoice => "❌ Debes estar en un canal de voz",
            Rejection::DifferentVoiceChannel => "❌ Debes estar en el mismo canal de voz que el bot",
            Rejection::NoActiveQueue => "❌ No hay una cola activa",
            Rejection::NothingPlaying => "❌ No hay nada reproduciéndose",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Reject(Rejection),
}

pub type Precondition = fn(&Invocation) -> Verdict;

pub fn in_guild(invocation: &Invocation) -> Verdict {
    if invocation.in_guild {
        Verdict::Continue
    } else {
        Verdict::Reject(Rejection::NotInGuild)
    }
}

pub fn in_voice(invocation: &Invocation) -> Verdict {
    match invocation.user_voice {
        Some(_) => Verdict::Continue,
        None => Verdict::Reject(Rejection::NotInVoice),
    }
}

/// Sólo rechaza si ya hay cola y el usuario está en otro canal
pub fn same_voice_if_active(invocation: &Invocation) -> Verdict {
    match (invocation.room_voice, invocation.user_voice) {
        (Some(room), Some(user)) if room != user => Verdict::Reject(Rejection::DifferentVoiceChannel),
        (Some(_), None) => Verdict::Reject(Rejection::NotInVoice),
        _ => Verdict::Continue,
    }
}

pub fn has_queue(invocation: &Invocation) -> Verdict {
    match invocation.room_voice {
        Some(_) => Verdict::Continue,
        None => Verdict::Reject(Rejection::NoActiveQueue),
    }
}

pub fn is_playing(invocation: &Invocation) -> Verdict {
    if invocation.playing {
        Verdict::Continue
    } else {
        Verdict::Reject(Rejection::NothingPlaying)
    }
}

/// Evalúa en orden y se detiene en el primer rechazo
pub fn evaluate(checks: &[Precondition], invocation: &Invocation) -> Verdict {
    checks
        .iter()
        .map(|check| check(invocation))
        .find(|verdict| *verdict != Verdict::Continue)
        .unwrap_or(Verdict::Continue)
}

const PLAY: &[Precondition] = &[in_guild, in_voice, same_voice_if_active];
const SKIP: &[Precondition] = &[in_guild, has_queue, same_voice_if_active, is_playing];
const CONTROL: &[Precondition] = &[in_guild, has_queue, same_voice_if_active];
const READ_ONLY: &[Precondition] = &[in_guild, has_queue];
const ANY: &[Precondition] = &[in_guild];

/// Precondiciones de cada comando
pub fn for_command(name: &str) -> &'static [Precondition] {
    match name {
        "play" => PLAY,
        "skip" | "voteskip" => SKIP,
        "pause" | "resume" | "stop" | "loop" | "shuffle" | "volume" | "filter" | "remove" => CONTROL,
        "queue" | "nowplaying" => READ_ONLY,
        _ => ANY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const VOICE: ChannelId = ChannelId::new(1);
    const OTHER: ChannelId = ChannelId::new(2);

    fn invocation(user_voice: Option<ChannelId>, room_voice: Option<ChannelId>, playing: bool) -> Invocation {
        Invocation {
            in_guild: true,
            user_voice,
            room_voice,
            playing,
        }
    }

    #[test]
    fn play_requires_voice_channel() {
        let checks = for_command("play");
        assert_eq!(
            evaluate(checks, &invocation(None, None, false)),
            Verdict::Reject(Rejection::NotInVoice)
        );
        assert_eq!(evaluate(checks, &invocation(Some(VOICE), None, false)), Verdict::Continue);
        assert_eq!(
            evaluate(checks, &invocation(Some(OTHER), Some(VOICE), true)),
            Verdict::Reject(Rejection::DifferentVoiceChannel)
        );
    }

    #[test]
    fn controls_need_an_active_queue() {
        assert_eq!(
            evaluate(for_command("pause"), &invocation(Some(VOICE), None, false)),
            Verdict::Reject(Rejection::NoActiveQueue)
        );
        assert_eq!(
            evaluate(for_command("pause"), &invocation(Some(VOICE), Some(VOICE), true)),
            Verdict::Continue
        );
    }

    #[test]
    fn skip_needs_something_playing() {
        assert_eq!(
            evaluate(for_command("skip"), &invocation(Some(VOICE), Some(VOICE), false)),
            Verdict::Reject(Rejection::NothingPlaying)
        );
    }

    #[test]
    fn first_rejection_wins() {
        let outside = Invocation::default();
        assert_eq!(
            evaluate(for_command("skip"), &outside),
            Verdict::Reject(Rejection::NotInGuild)
        );
    }

    #[test]
    fn read_only_commands_ignore_voice_channel() {
        assert_eq!(
            evaluate(for_command("queue"), &invocation(None, Some(VOICE), true)),
            Verdict::Continue
        );
    }
}
