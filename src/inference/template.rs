//! Chat templates: a registry of well-known jinja templates and a renderer.
//!
//! | name      | format                                                   |
//! |-----------|----------------------------------------------------------|
//! | `chatml`  | `<\|im_start\|>role\n...<\|im_end\|>` (Qwen, Hermes, ...) |
//! | `llama3`  | `<\|start_header_id\|>` / `<\|eot_id\|>`                 |
//! | `llama2`  | `[INST]` with a `<<SYS>>` block                          |
//! | `mistral` | `[INST]` without a system block                          |
//! | `phi3`    | `<\|user\|>` / `<\|end\|>`                               |
//! | `gemma`   | `<start_of_turn>` / `<end_of_turn>`                      |
//! | `zephyr`  | `<\|user\|>` terminated by EOS                           |
//! | `alpaca`  | `### Instruction:` / `### Response:`                     |
//!
//! Every built-in template is prefix-stable: rendering a truncated message
//! list (without the generation prompt) yields a prefix of the full render.

use minijinja::{context, Environment, Error, ErrorKind, Value};
use serde::{Deserialize, Serialize};

use crate::inference::llama_ffi::ChatMessageRef;

const CHATML: &str = "{% for message in messages %}{{ '<|im_start|>' + message['role'] + '\\n' + message['content'] + '<|im_end|>\\n' }}{% endfor %}{% if add_generation_prompt %}{{ '<|im_start|>assistant\\n' }}{% endif %}";

const LLAMA3: &str = "{{ bos_token }}{% for message in messages %}{{ '<|start_header_id|>' + message['role'] + '<|end_header_id|>\\n\\n' + message['content'] + '<|eot_id|>' }}{% endfor %}{% if add_generation_prompt %}{{ '<|start_header_id|>assistant<|end_header_id|>\\n\\n' }}{% endif %}";

const LLAMA2: &str = "{% for message in messages %}{% if message['role'] == 'system' %}{{ '<<SYS>>\\n' + message['content'] + '\\n<</SYS>>\\n\\n' }}{% elif message['role'] == 'user' %}{{ bos_token + '[INST] ' + message['content'] + ' [/INST]' }}{% elif message['role'] == 'assistant' %}{{ ' ' + message['content'] + ' ' + eos_token }}{% endif %}{% endfor %}";

const MISTRAL: &str = "{{ bos_token }}{% for message in messages %}{% if message['role'] == 'user' %}{{ '[INST] ' + message['content'] + ' [/INST]' }}{% elif message['role'] == 'assistant' %}{{ message['content'] + eos_token }}{% else %}{{ message['content'] + '\\n\\n' }}{% endif %}{% endfor %}";

const PHI3: &str = "{% for message in messages %}{{ '<|' + message['role'] + '|>\\n' + message['content'] + '<|end|>\\n' }}{% endfor %}{% if add_generation_prompt %}{{ '<|assistant|>\\n' }}{% endif %}";

const GEMMA: &str = "{{ bos_token }}{% for message in messages %}{% if message['role'] == 'assistant' %}{% set role = 'model' %}{% else %}{% set role = message['role'] %}{% endif %}{{ '<start_of_turn>' + role + '\\n' + message['content'] + '<end_of_turn>\\n' }}{% endfor %}{% if add_generation_prompt %}{{ '<start_of_turn>model\\n' }}{% endif %}";

const ZEPHYR: &str = "{% for message in messages %}{{ '<|' + message['role'] + '|>\\n' + message['content'] + eos_token + '\\n' }}{% endfor %}{% if add_generation_prompt %}{{ '<|assistant|>\\n' }}{% endif %}";

const ALPACA: &str = "{% for message in messages %}{% if message['role'] == 'system' %}{{ message['content'] + '\\n\\n' }}{% elif message['role'] == 'user' %}{{ '### Instruction:\\n' + message['content'] + '\\n\\n' }}{% else %}{{ '### Response:\\n' + message['content'] + '\\n\\n' }}{% endif %}{% endfor %}{% if add_generation_prompt %}{{ '### Response:\\n' }}{% endif %}";

const BUILTIN: &[(&str, &str)] = &[
    ("chatml", CHATML),
    ("llama3", LLAMA3),
    ("llama2", LLAMA2),
    ("mistral", MISTRAL),
    ("phi3", PHI3),
    ("gemma", GEMMA),
    ("zephyr", ZEPHYR),
    ("alpaca", ALPACA),
];

/// The template a session renders with, and where it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatTemplate {
    /// "Custom Jinja", a template name, or `tokenizer.chat_template`.
    pub source: String,

    /// Jinja text.
    pub text: String,

    /// `bos_token` / `eos_token` text of the model the template renders for.
    pub bos_token: String,
    pub eos_token: String,
}

impl ChatTemplate {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_special_tokens(mut self, bos: impl Into<String>, eos: impl Into<String>) -> Self {
        self.bos_token = bos.into();
        self.eos_token = eos.into();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Render with this template's own special-token text.
    pub fn render(
        &self,
        messages: &[ChatMessageRef<'_>],
        add_generation_prompt: bool,
    ) -> Result<String, Error> {
        let special = SpecialTokens {
            bos: &self.bos_token,
            eos: &self.eos_token,
        };
        render(&self.text, messages, add_generation_prompt, special)
    }
}

/// Look up a built-in template by name (case-insensitive).
pub fn builtin(name: &str) -> Option<&'static str> {
    let name = name.to_ascii_lowercase();
    BUILTIN
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, text)| *text)
}

/// Names of all built-in templates.
pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTIN.iter().map(|(n, _)| *n)
}

/// Special-token text made available to templates.
#[derive(Debug, Clone, Copy)]
pub struct SpecialTokens<'a> {
    pub bos: &'a str,
    pub eos: &'a str,
}

/// Render a jinja chat template.
///
/// Templates see `messages` (a list of `{role, content}`), `add_generation_prompt`,
/// `bos_token`, `eos_token`, and a `raise_exception(msg)` helper.
pub fn render(
    template: &str,
    messages: &[ChatMessageRef<'_>],
    add_generation_prompt: bool,
    special: SpecialTokens<'_>,
) -> Result<String, Error> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_function("raise_exception", |msg: String| -> Result<Value, Error> {
        Err(Error::new(ErrorKind::InvalidOperation, msg))
    });

    let messages: Vec<Value> = messages
        .iter()
        .map(|m| context! { role => m.role, content => m.content })
        .collect();

    env.render_str(
        template,
        context! {
            messages => messages,
            add_generation_prompt => add_generation_prompt,
            bos_token => special.bos,
            eos_token => special.eos,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKENS: SpecialTokens<'static> = SpecialTokens {
        bos: "<s>",
        eos: "</s>",
    };

    fn msgs() -> Vec<ChatMessageRef<'static>> {
        vec![
            ChatMessageRef {
                role: "system",
                content: "Be brief.",
            },
            ChatMessageRef {
                role: "user",
                content: "Hello",
            },
            ChatMessageRef {
                role: "assistant",
                content: "Hi there.",
            },
        ]
    }

    #[test]
    fn test_chatml_render() {
        let out = render(CHATML, &msgs()[..2], true, TOKENS).unwrap();
        assert_eq!(
            out,
            "<|im_start|>system\nBe brief.<|im_end|>\n<|im_start|>user\nHello<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_builtin_lookup() {
        assert!(builtin("ChatML").is_some());
        assert!(builtin("nonexistent").is_none());
        assert_eq!(builtin_names().count(), BUILTIN.len());
    }

    #[test]
    fn test_builtins_are_prefix_stable() {
        let all = msgs();
        for (name, text) in BUILTIN {
            let full = render(text, &all, false, TOKENS).unwrap();
            for keep in 0..all.len() {
                let partial = render(text, &all[..keep], false, TOKENS).unwrap();
                assert!(
                    full.starts_with(&partial),
                    "{name} is not prefix-stable at {keep} messages"
                );
            }
        }
    }

    #[test]
    fn test_generation_prompt_extends_render() {
        let all = msgs();
        let without = render(CHATML, &all[..2], false, TOKENS).unwrap();
        let with = render(CHATML, &all[..2], true, TOKENS).unwrap();
        assert!(with.starts_with(&without));
        assert!(with.len() > without.len());
    }

    #[test]
    fn test_template_renders_with_own_specials() {
        let template = ChatTemplate::new("llama3", LLAMA3).with_special_tokens("<|begin_of_text|>", "");
        let out = template.render(&msgs()[1..2], false).unwrap();
        assert!(out.starts_with("<|begin_of_text|><|start_header_id|>user"));
    }

    #[test]
    fn test_raise_exception_fails_render() {
        let template = "{{ raise_exception('no system role') }}";
        assert!(render(template, &msgs(), false, TOKENS).is_err());
    }
}
