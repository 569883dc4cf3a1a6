pub mod script;
pub mod voice;

pub use script::{
    fallback_script, GeneratedScript, HttpScriptGenerator, ScriptGenerator, ScriptRequest,
    TemplateScriptGenerator,
};
pub use voice::{HttpVoiceSynthesizer, LocalVoiceSynthesizer, VoiceJob, VoiceQueue, VoiceSynthesizer};
