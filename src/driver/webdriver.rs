//! # Driver WebDriver (thirtyfour)
//!
//! Implementação concreta de [`RemoteDriver`] sobre um Chrome controlado via
//! WebDriver. O ERP renderiza a listagem e o formulário dentro de um iframe
//! (`#iframe_11`), então quase toda operação é um script executado na página
//! que resolve o documento do iframe primeiro.
//!
//! ## Convenções da tela remota:
//!
//! - Campos: `#id_sc_field_<id>` (ex: `#id_sc_field_cf_cnpjx`)
//! - Códigos da listagem: `span[id^="id_sc_field_cf_codigo_"]`
//! - Botão editar da linha: `a#bedit`
//! - Busca rápida: `#SC_fast_search_top` + `#SC_fast_search_submit_top`
//! - Salvar / Voltar: `#sc_b_upd_t` / `#sc_b_sai_t`
//! - Diálogos: SweetAlert2 (`.swal2-popup`, `.swal2-toast`), na página ou no iframe
//!
//! Scripts retornam valores simples (bool, string, arrays) que são
//! convertidos com `ScriptRet::convert`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::time::sleep;
use tracing::{debug, info};

use super::{Credentials, Dialog, DialogKind, DriverFactory, ModulePath, RemoteDriver, RowHandle, UiAction};
use crate::errors::{DriverError, DriverResult};
use crate::protocol::FormField;
use crate::wait::await_condition;

/// Pausa após cada clique no cabeçalho de ordenação.
const SORT_SETTLE: Duration = Duration::from_millis(2000);

/// Pausa após trocar de página na listagem.
const PAGE_SETTLE: Duration = Duration::from_millis(800);

/// Prazo para o menu aparecer após o login e para o módulo carregar.
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Seletores do botão de confirmação do SweetAlert.
const CONFIRM_BUTTONS: &str = r#"['button.swal2-confirm', 'button.scButton_sweetalertok', '.swal2-actions button', 'button[class*="swal"]']"#;

#[derive(Debug, Deserialize)]
struct RawDialog {
    kind: String,
    text: String,
}

/// Traduz erros do thirtyfour. Sessão morta vira `SessionClosed`.
fn map_err(err: WebDriverError) -> DriverError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("invalid session id")
        || lower.contains("no such window")
        || lower.contains("session deleted")
        || lower.contains("disconnected")
    {
        DriverError::SessionClosed
    } else {
        DriverError::WebDriver(message)
    }
}

// ============================================================================
// SESSÃO
// ============================================================================

/// Sessão de navegador logada no ERP.
pub struct WebDriverSession {
    driver: WebDriver,
    /// Trecho JS que define `doc` como o documento do iframe de conteúdo.
    prelude: String,
}

impl WebDriverSession {
    pub fn new(driver: WebDriver, frame_selector: &str) -> Self {
        let prelude = format!(
            "const frame = document.querySelector({sel});\n\
             const doc = (frame && frame.contentDocument) ? frame.contentDocument : null;\n",
            sel = json!(frame_selector)
        );
        Self { driver, prelude }
    }

    /// Executa um script com `doc` já resolvido e converte o retorno.
    async fn eval<T: DeserializeOwned>(&self, body: &str, args: Vec<Value>) -> DriverResult<T> {
        let script = format!("{}{}", self.prelude, body);
        let ret = self.driver.execute(&script, args).await.map_err(map_err)?;
        ret.convert::<T>()
            .map_err(|e| DriverError::Script(e.to_string()))
    }

    /// Script que devolve `true` quando encontrou e acionou o elemento.
    async fn act(&self, what: &str, body: &str, args: Vec<Value>) -> DriverResult<()> {
        if self.eval::<bool>(body, args).await? {
            Ok(())
        } else {
            Err(DriverError::ElementNotFound(what.to_string()))
        }
    }

    async fn click_by_text(&self, scope: &str, text: &str) -> DriverResult<bool> {
        self.eval(
            r#"
            const [scope, text] = arguments;
            const root = scope === 'frame' ? doc : document;
            if (!root) return false;
            for (const link of root.querySelectorAll('a, span.menu-text, button')) {
                const label = link.textContent.trim();
                const hit = scope === 'frame' ? label === text : label.includes(text);
                if (hit) { link.click(); return true; }
            }
            return false;
            "#,
            vec![json!(scope), json!(text)],
        )
        .await
    }
}

#[async_trait]
impl RemoteDriver for WebDriverSession {
    async fn navigate_to(&self, url: &str) -> DriverResult<()> {
        self.driver.goto(url).await.map_err(map_err)
    }

    async fn login(&self, credentials: &Credentials) -> DriverResult<()> {
        info!(user = %credentials.user, "Fazendo login");
        self.act(
            "formulário de login",
            r#"
            const [user, password] = arguments;
            const email = document.querySelector('input[placeholder*="e-mail"]');
            const pass = document.querySelector('input[placeholder*="senha"]');
            if (!email || !pass) return false;
            for (const [input, value] of [[email, user], [pass, password]]) {
                input.value = value;
                input.dispatchEvent(new Event('input', { bubbles: true }));
                input.dispatchEvent(new Event('change', { bubbles: true }));
            }
            for (const button of document.querySelectorAll('button')) {
                if (button.textContent.includes('Acessar')) { button.click(); return true; }
            }
            return false;
            "#,
            vec![json!(credentials.user), json!(credentials.password)],
        )
        .await?;

        let menu_ready = await_condition(NAVIGATION_TIMEOUT, Duration::from_millis(250), move || async move {
            self.eval::<bool>("return document.querySelectorAll('a.nav-link').length > 0;", vec![])
                .await
                .unwrap_or(false)
        })
        .await;

        if menu_ready {
            Ok(())
        } else {
            Err(DriverError::ElementNotFound("menu após login".into()))
        }
    }

    async fn open_module(&self, path: &ModulePath) -> DriverResult<()> {
        if !self.click_by_text("page", &path.menu).await? {
            return Err(DriverError::ElementNotFound(path.menu.clone()));
        }
        sleep(Duration::from_millis(1000)).await;
        if !self.click_by_text("page", &path.item).await? {
            return Err(DriverError::ElementNotFound(path.item.clone()));
        }

        let loaded = await_condition(NAVIGATION_TIMEOUT, Duration::from_millis(250), move || async move {
            self.eval::<bool>("return !!(doc && doc.querySelector('#SC_fast_search_top'));", vec![])
                .await
                .unwrap_or(false)
        })
        .await;

        if loaded {
            info!(module = %path.item, "Módulo carregado");
            Ok(())
        } else {
            Err(DriverError::ElementNotFound("#SC_fast_search_top".into()))
        }
    }

    async fn search(&self, key: &str) -> DriverResult<()> {
        debug!(key = %key, "Pesquisando código");
        self.act(
            "#SC_fast_search_top",
            r#"
            if (!doc) return false;
            const input = doc.querySelector('#SC_fast_search_top');
            const submit = doc.querySelector('#SC_fast_search_submit_top');
            if (!input || !submit) return false;
            input.value = arguments[0];
            input.dispatchEvent(new Event('input', { bubbles: true }));
            input.dispatchEvent(new Event('change', { bubbles: true }));
            submit.click();
            return true;
            "#,
            vec![json!(key)],
        )
        .await
    }

    async fn visible_rows(&self) -> DriverResult<Vec<RowHandle>> {
        let keys: Vec<String> = self
            .eval(
                r#"
                if (!doc) return [];
                return Array.from(doc.querySelectorAll('span[id^="id_sc_field_cf_codigo_"]'))
                    .map(span => span.textContent.trim());
                "#,
                vec![],
            )
            .await?;
        Ok(keys
            .into_iter()
            .enumerate()
            .map(|(position, key_text)| RowHandle { position, key_text })
            .collect())
    }

    async fn listing_empty(&self) -> DriverResult<bool> {
        self.eval(
            r#"
            if (!doc || !doc.body) return false;
            const message = doc.querySelector('.scGridNoRecordsMessage, .scGridEmpty');
            if (message && message.offsetParent !== null) return true;
            const text = doc.body.innerText || '';
            return text.includes('Nenhum registro') || text.includes('No records');
            "#,
            vec![],
        )
        .await
    }

    async fn listing_visible(&self) -> DriverResult<bool> {
        self.eval(
            "return !!(doc && doc.querySelector('.scGridTabela, table.scGridTabela, #grid_row_0'));",
            vec![],
        )
        .await
    }

    async fn click_edit(&self, row: &RowHandle) -> DriverResult<()> {
        self.act(
            "a#bedit",
            r#"
            const [position, expected] = arguments;
            if (!doc) return false;
            const spans = doc.querySelectorAll('span[id^="id_sc_field_cf_codigo_"]');
            const span = spans[position];
            if (!span || span.textContent.trim() !== expected) return false;
            const line = span.closest('tr');
            const edit = line ? line.querySelector('a#bedit') : null;
            if (!edit) return false;
            edit.click();
            return true;
            "#,
            vec![json!(row.position), json!(row.key_text)],
        )
        .await
    }

    async fn field_visible(&self, field: FormField) -> DriverResult<bool> {
        self.eval(
            r#"
            if (!doc) return false;
            const input = doc.querySelector('#id_sc_field_' + arguments[0]);
            return !!(input && input.offsetParent !== null);
            "#,
            vec![json!(field.remote_id())],
        )
        .await
    }

    async fn read_field(&self, field: FormField) -> DriverResult<String> {
        let value: Option<String> = self
            .eval(
                r#"
                if (!doc) return null;
                const input = doc.querySelector('#id_sc_field_' + arguments[0]);
                return input ? (input.value || '').trim() : null;
                "#,
                vec![json!(field.remote_id())],
            )
            .await?;
        value.ok_or_else(|| DriverError::ElementNotFound(field.remote_id().to_string()))
    }

    async fn set_field(&self, field: FormField, value: &str) -> DriverResult<()> {
        self.act(
            field.remote_id(),
            r#"
            const [id, value] = arguments;
            if (!doc) return false;
            const input = doc.querySelector('#id_sc_field_' + id);
            if (!input || input.disabled) return false;
            input.value = value;
            for (const name of ['input', 'change', 'blur']) {
                input.dispatchEvent(new Event(name, { bubbles: true }));
            }
            return true;
            "#,
            vec![json!(field.remote_id()), json!(value)],
        )
        .await
    }

    async fn set_radio(&self, group: &str, value: &str) -> DriverResult<()> {
        self.act(
            group,
            r#"
            const [group, value] = arguments;
            if (!doc) return false;
            for (const radio of doc.querySelectorAll('input[name="' + group + '"]')) {
                if (radio.value === value) {
                    radio.checked = true;
                    radio.dispatchEvent(new Event('change', { bubbles: true }));
                    return true;
                }
            }
            return false;
            "#,
            vec![json!(group), json!(value)],
        )
        .await
    }

    async fn set_select(&self, name: &str, value: &str) -> DriverResult<()> {
        self.act(
            name,
            r#"
            const [name, value] = arguments;
            if (!doc) return false;
            const select = doc.querySelector('#id_sc_field_' + name);
            if (!select || select.disabled) return false;
            select.value = value;
            select.dispatchEvent(new Event('change', { bubbles: true }));
            return true;
            "#,
            vec![json!(name), json!(value)],
        )
        .await
    }

    async fn click(&self, action: UiAction) -> DriverResult<()> {
        let selector = match action {
            UiAction::Save => "#sc_b_upd_t",
            UiAction::Back => "#sc_b_sai_t",
        };
        self.act(
            selector,
            r#"
            if (!doc) return false;
            const button = doc.querySelector(arguments[0]);
            if (!button) return false;
            button.click();
            return true;
            "#,
            vec![json!(selector)],
        )
        .await
    }

    async fn detect_dialog(&self) -> DriverResult<Option<Dialog>> {
        let raw: Option<RawDialog> = self
            .eval(
                r#"
                const toast = document.querySelector('.swal2-toast');
                if (toast) {
                    const text = toast.textContent || '';
                    if (toast.querySelector('.swal2-success') || text.toLowerCase().includes('sucesso')) {
                        return { kind: 'success', text: text.trim() };
                    }
                }
                for (const root of [document, doc]) {
                    if (!root) continue;
                    const popup = root.querySelector('.swal2-popup:not(.swal2-toast)');
                    if (!popup || popup.offsetParent === null) continue;
                    const text = (popup.innerText || '').trim();
                    const lower = text.toLowerCase();
                    const error = popup.querySelector('.swal2-error')
                        || popup.querySelector('.swal2-warning')
                        || lower.includes('inválido') || lower.includes('erro')
                        || lower.includes('obrigat');
                    return { kind: error ? 'error' : 'confirm', text: text.substring(0, 300) };
                }
                return null;
                "#,
                vec![],
            )
            .await?;

        Ok(raw.map(|d| Dialog {
            kind: match d.kind.as_str() {
                "success" => DialogKind::Success,
                "error" => DialogKind::Error,
                _ => DialogKind::Confirm,
            },
            text: d.text,
        }))
    }

    async fn dismiss_dialog(&self) -> DriverResult<bool> {
        let body = format!(
            r#"
            const selectors = {CONFIRM_BUTTONS};
            for (const root of [document, doc]) {{
                if (!root) continue;
                for (const selector of selectors) {{
                    for (const button of root.querySelectorAll(selector)) {{
                        if (button.offsetParent !== null) {{ button.click(); return true; }}
                    }}
                }}
            }}
            return false;
            "#
        );
        for _ in 0..2 {
            if self.eval::<bool>(&body, vec![]).await? {
                sleep(Duration::from_millis(200)).await;
                return Ok(true);
            }
            sleep(Duration::from_millis(150)).await;
        }
        Ok(false)
    }

    async fn sort_ascending_by(&self, column: &str) -> DriverResult<()> {
        // O cabeçalho alterna a ordem: dois cliques deixam em ordem crescente.
        for _ in 0..2 {
            if !self.click_by_text("frame", column).await? {
                return Err(DriverError::ElementNotFound(format!("cabeçalho {}", column)));
            }
            sleep(SORT_SETTLE).await;
        }
        Ok(())
    }

    async fn first_page(&self) -> DriverResult<()> {
        self.eval::<bool>(
            r#"
            if (!doc) return false;
            const first = doc.querySelector('[title*="início"], [title*="Retornar ao início"], .scGridNavFirst');
            if (first && first.offsetParent !== null) { first.click(); return true; }
            for (const link of doc.querySelectorAll('a[href*="submit_rec(1)"]')) {
                if (link.offsetParent !== null) { link.click(); return true; }
            }
            return false;
            "#,
            vec![],
        )
        .await?;
        sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    async fn next_page(&self) -> DriverResult<bool> {
        let moved: bool = self
            .eval(
                r#"
                if (!doc) return false;
                for (const button of doc.querySelectorAll('a, button, span')) {
                    const text = button.textContent.trim();
                    const title = button.getAttribute('title') || '';
                    if (title.includes('Avançar') || title.includes('Próxim') || text === '>' || text === '»') {
                        button.click();
                        return true;
                    }
                }
                return false;
                "#,
                vec![],
            )
            .await?;
        if moved {
            sleep(PAGE_SETTLE).await;
        }
        Ok(moved)
    }

    async fn close(&self) -> DriverResult<()> {
        self.driver.clone().quit().await.map_err(map_err)
    }
}

// ============================================================================
// FÁBRICA
// ============================================================================

/// Abre sessões Chrome novas no servidor WebDriver configurado.
pub struct WebDriverFactory {
    pub webdriver_url: String,
    pub headless: bool,
    pub frame_selector: String,
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    async fn create(&self) -> DriverResult<Box<dyn RemoteDriver>> {
        let mut caps = DesiredCapabilities::chrome();
        if self.headless {
            caps.add_chrome_arg("--headless").map_err(map_err)?;
        }
        caps.add_chrome_arg("--no-sandbox").map_err(map_err)?;
        caps.add_chrome_arg("--disable-dev-shm-usage").map_err(map_err)?;
        caps.add_chrome_arg("--window-size=1920,1080").map_err(map_err)?;

        let driver = WebDriver::new(&self.webdriver_url, caps)
            .await
            .map_err(map_err)?;
        debug!(url = %self.webdriver_url, "Sessão WebDriver criada");

        Ok(Box::new(WebDriverSession::new(driver, &self.frame_selector)))
    }
}
