use minijinja::{context, Environment};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub personality: &'a str,
    pub objective: &'a str,
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            personality => ctx.personality.trim(),
            objective => ctx.objective.trim(),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = String::new();
    if !ctx.personality.trim().is_empty() {
        prompt.push_str(ctx.personality.trim());
        prompt.push('\n');
    }
    if !ctx.objective.trim().is_empty() {
        prompt.push_str(ctx.objective.trim());
        prompt.push('\n');
    }
    prompt.push_str(
        "\nCONTEXTO IMPORTANTE (GHL/CRM):\n\
         - Você é um agente interno operando dentro do CRM GoHighLevel (GHL).\n\
         - NUNCA peça IDs internos (contactId, conversationId, etc) e NUNCA mencione esses IDs.\n\
         - Se você não conseguir acessar um dado no CRM, diga que não conseguiu acessar a informação no momento.\n\
         - NUNCA invente links. Só compartilhe uma URL se ela aparecer no contexto como “URL de referência: <url>”.\n\
         \nFORMATAÇÃO:\n\
         - Use *asteriscos* para negrito e _underscores_ para itálico.\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_persona_and_policy() {
        let rendered = render_system_prompt(&SystemPromptContext {
            personality: "Você é a Ana, atendente cordial.",
            objective: "Ajudar clientes com dúvidas sobre o cadastro.",
        });
        assert!(rendered.contains("Você é a Ana"));
        assert!(rendered.contains("Ajudar clientes"));
        assert!(rendered.contains("NUNCA peça IDs internos"));
        assert!(rendered.contains("URL de referência"));
        assert!(rendered.contains("*asteriscos*"));
    }

    #[test]
    fn fallback_prompt_keeps_policy_header() {
        let rendered = fallback_system_prompt(&SystemPromptContext {
            personality: "",
            objective: "Atender bem.",
        });
        assert!(rendered.contains("Atender bem."));
        assert!(rendered.contains("NUNCA peça IDs internos"));
    }
}
