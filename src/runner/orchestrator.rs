use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ai::AiEngine;
use crate::command::{
    is_truthy, AirplaneValue, Command, CommandKind, Condition, FlowConfig, LaunchAppParams,
    RepeatParams, RetryParams, ScrollUntilVisibleParams, SwipeParams, TravelParams,
};
use crate::driver::{DeviceInfo, Driver, Point, ScreenRecording, SwipeDirection};
use crate::error::FlowError;
use crate::runner::controller::FlowController;
use crate::runner::metadata::{Insight, InsightLevel, MetadataStore};
use crate::runner::observer::{ErrorResolution, FlowObserver, NoopObserver};
use crate::script::{create_engine, BoaScriptEngine, ScriptEngine};

/// Default deadline for element lookups.
pub const LOOKUP_TIMEOUT_MS: u64 = 17_000;
/// Lookup deadline when the command or selector is optional.
pub const OPTIONAL_LOOKUP_TIMEOUT_MS: u64 = 7_000;
/// Whole-search deadline for scrolling searches.
pub const SCROLL_TIMEOUT_MS: u64 = 20_000;

const ERASE_ALL_CHARS: u64 = 50;

/// The flow orchestrator: interprets an ordered command list against a
/// device driver, firing observer callbacks and accumulating per-command
/// metadata along the way.
///
/// One instance runs one flow at a time on a single task; parallel flows
/// use independent instances, each with its own script engine and
/// controller.
pub struct Orchestrator {
    pub(crate) driver: Box<dyn Driver>,
    pub(crate) observer: Arc<dyn FlowObserver>,
    ai_engine: Option<Arc<dyn AiEngine>>,
    controller: FlowController,
    pub(crate) cancellation: CancellationToken,
    pub(crate) engine: Box<dyn ScriptEngine>,
    pub(crate) metadata: MetadataStore,
    pub(crate) lookup_timeout_ms: u64,
    pub(crate) optional_lookup_timeout_ms: u64,
    time_of_last_interaction: Instant,
    copied_text: Option<String>,
    screen_recording: Option<Box<dyn ScreenRecording>>,
    cached_device_info: Option<DeviceInfo>,
}

impl Orchestrator {
    pub fn new(driver: Box<dyn Driver>) -> Self {
        Self {
            driver,
            observer: Arc::new(NoopObserver),
            ai_engine: None,
            controller: FlowController::new(),
            cancellation: CancellationToken::new(),
            engine: Box::new(BoaScriptEngine::new()),
            metadata: MetadataStore::new(),
            lookup_timeout_ms: LOOKUP_TIMEOUT_MS,
            optional_lookup_timeout_ms: OPTIONAL_LOOKUP_TIMEOUT_MS,
            time_of_last_interaction: Instant::now(),
            copied_text: None,
            screen_recording: None,
            cached_device_info: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn FlowObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_ai_engine(mut self, ai_engine: Arc<dyn AiEngine>) -> Self {
        self.ai_engine = Some(ai_engine);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_lookup_timeouts(mut self, lookup_ms: u64, optional_lookup_ms: u64) -> Self {
        self.lookup_timeout_ms = lookup_ms;
        self.optional_lookup_timeout_ms = optional_lookup_ms;
        self
    }

    /// Shared pause handle; clone it to control the flow from outside.
    pub fn controller(&self) -> FlowController {
        self.controller.clone()
    }

    /// Snapshot of a command's accumulated metadata.
    pub fn command_metadata(
        &self,
        command: &Command,
    ) -> Option<crate::runner::metadata::CommandMetadata> {
        self.metadata.get(command.id)
    }

    pub fn time_of_last_interaction(&self) -> Instant {
        self.time_of_last_interaction
    }

    /// Run a flow to completion. Returns overall success; errors surface
    /// only for failures outside the per-command policy (bad substitution,
    /// driver loss during hooks).
    pub async fn run_flow(&mut self, commands: &[Command]) -> Result<bool, FlowError> {
        let flow_id = Uuid::new_v4();
        info!(%flow_id, commands = commands.len(), "starting flow");

        let config = FlowConfig::locate(commands);
        self.init_script_engine(&config);
        self.init_driver_extensions(&config).await?;

        self.observer.on_flow_start(commands);

        // Variable definitions are hoisted ahead of everything else.
        let defines: Vec<Command> = commands
            .iter()
            .filter(|c| matches!(c.kind, CommandKind::DefineVariables { .. }))
            .cloned()
            .collect();
        if !defines.is_empty() {
            self.execute_commands(&defines, &config).await?;
        }
        let filtered: Vec<Command> = commands
            .iter()
            .filter(|c| !matches!(c.kind, CommandKind::DefineVariables { .. }))
            .cloned()
            .collect();

        let mut flow_ok = true;
        let mut flow_err: Option<FlowError> = None;

        let on_start_ok = if config.on_flow_start.is_empty() {
            true
        } else {
            match self.execute_commands(&config.on_flow_start, &config).await {
                Ok(ok) => ok,
                Err(e) => {
                    flow_err = Some(e);
                    false
                }
            }
        };

        if flow_err.is_none() && on_start_ok {
            match self.execute_commands(&filtered, &config).await {
                Ok(ok) => flow_ok = ok,
                Err(e) => flow_err = Some(e),
            }
            self.close_screen_recording().await;
        }

        // The completion hook runs whether the body succeeded, failed or
        // threw; a body error is re-raised afterwards.
        let on_complete_ok = if config.on_flow_complete.is_empty() {
            true
        } else {
            match self.execute_commands(&config.on_flow_complete, &config).await {
                Ok(ok) => ok,
                Err(e) => {
                    if flow_err.is_none() {
                        flow_err = Some(e);
                    }
                    false
                }
            }
        };

        if let Some(e) = flow_err {
            info!(%flow_id, "flow aborted: {e}");
            return Err(e);
        }

        let success = on_complete_ok && flow_ok;
        info!(%flow_id, success, "flow finished");
        Ok(success)
    }

    /// Replace the script engine according to flow configuration, closing
    /// the previous one. Exclusive access via `&mut self` guards the swap.
    pub fn init_script_engine(&mut self, config: &FlowConfig) {
        self.engine.close();
        self.engine = create_engine(&config.ext);
        self.engine.set_copied_text(self.copied_text.clone());
    }

    async fn init_driver_extensions(&mut self, config: &FlowConfig) -> Result<(), FlowError> {
        if config.ext.get("androidWebViewHierarchy").map(String::as_str) == Some("devtools") {
            self.driver.set_android_chrome_dev_tools_enabled(true).await?;
        }
        Ok(())
    }

    /// Top-level command loop: failures consult the observer and turn into
    /// an overall `false` on [`ErrorResolution::Fail`].
    async fn execute_commands(
        &mut self,
        commands: &[Command],
        config: &FlowConfig,
    ) -> Result<bool, FlowError> {
        for (index, raw) in commands.iter().enumerate() {
            if self.cancellation.is_cancelled() {
                self.observer.on_command_skipped(index, raw);
                continue;
            }
            self.controller.wait_if_paused(&self.cancellation).await;

            match self.run_command_step(index, raw, config).await? {
                StepOutcome::Completed(_) => self.observer.on_command_complete(index, raw),
                StepOutcome::Warned => self.observer.on_command_warned(index, raw),
                StepOutcome::Skipped => self.observer.on_command_skipped(index, raw),
                StepOutcome::Failed(e) => {
                    match self.observer.on_command_failed(index, raw, &e) {
                        ErrorResolution::Fail => return Ok(false),
                        ErrorResolution::Continue => continue,
                    }
                }
            }
        }
        Ok(true)
    }

    /// Sub-flow command loop. Same per-command policy, but a failing
    /// command propagates as an error (so an enclosing Retry can catch it)
    /// and the return value reports whether anything mutated the device.
    async fn execute_subflow_commands(
        &mut self,
        commands: &[Command],
        config: &FlowConfig,
    ) -> Result<bool, FlowError> {
        let mut mutated = false;
        for (index, raw) in commands.iter().enumerate() {
            if self.cancellation.is_cancelled() {
                self.observer.on_command_skipped(index, raw);
                continue;
            }
            self.controller.wait_if_paused(&self.cancellation).await;

            match self.run_command_step(index, raw, config).await? {
                StepOutcome::Completed(m) => {
                    mutated |= m;
                    self.observer.on_command_complete(index, raw);
                }
                StepOutcome::Warned => self.observer.on_command_warned(index, raw),
                StepOutcome::Skipped => self.observer.on_command_skipped(index, raw),
                StepOutcome::Failed(e) => {
                    match self.observer.on_command_failed(index, raw, &e) {
                        ErrorResolution::Fail => return Err(e),
                        ErrorResolution::Continue => continue,
                    }
                }
            }
        }
        Ok(mutated)
    }

    /// One raw command: start callback, substitution, execution, and
    /// classification into a terminal outcome. Substitution errors
    /// propagate to the flow level instead of the failure policy.
    async fn run_command_step(
        &mut self,
        index: usize,
        raw: &Command,
        config: &FlowConfig,
    ) -> Result<StepOutcome, FlowError> {
        self.observer.on_command_start(index, raw);
        self.install_log_sink(raw);

        let evaluated = match raw.evaluate_scripts(self.engine.as_mut()) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.clear_log_sink();
                return Err(e);
            }
        };
        debug!(command = %evaluated.describe(), "executing command");
        self.metadata.update(raw, &*self.observer, |m| {
            m.evaluated_command = Some(evaluated.clone());
            m.labeled_command =
                Some(raw.label.clone().unwrap_or_else(|| evaluated.describe()));
        });

        let outcome = match self.execute_with_demotion(&evaluated, raw, config).await {
            Ok(mutating) => StepOutcome::Completed(mutating),
            Err(FlowError::CommandWarned(message)) => {
                self.set_insight(raw, InsightLevel::Warning, message);
                StepOutcome::Warned
            }
            Err(FlowError::CommandSkipped) => StepOutcome::Skipped,
            Err(e) => StepOutcome::Failed(e),
        };

        self.clear_log_sink();
        Ok(outcome)
    }

    /// Apply the optional-demotion rule around [`execute_command`]: domain
    /// failures on optional commands/selectors become warnings.
    ///
    /// [`execute_command`]: Self::execute_command
    async fn execute_with_demotion(
        &mut self,
        evaluated: &Command,
        raw: &Command,
        config: &FlowConfig,
    ) -> Result<bool, FlowError> {
        match self.execute_command(evaluated, config).await {
            Err(e) if e.is_domain() && (raw.optional || raw.selector_optional()) => {
                Err(FlowError::CommandWarned(e.to_string()))
            }
            other => other,
        }
    }

    /// Execute one evaluated command. Returns whether it mutated device
    /// state; mutations advance the interaction clock.
    async fn execute_command(
        &mut self,
        command: &Command,
        config: &FlowConfig,
    ) -> Result<bool, FlowError> {
        self.controller.wait_if_paused(&self.cancellation).await;

        if let Some(condition) = &command.condition {
            if !self
                .evaluate_condition(condition, command.optional, None)
                .await?
            {
                debug!(condition = %condition.description(), "condition not met, skipping");
                return Err(FlowError::CommandSkipped);
            }
        }

        let mutating = self.dispatch_command(command, config).await?;
        if mutating {
            self.time_of_last_interaction = Instant::now();
        }
        Ok(mutating)
    }

    async fn dispatch_command(
        &mut self,
        command: &Command,
        config: &FlowConfig,
    ) -> Result<bool, FlowError> {
        match &command.kind {
            CommandKind::TapOnElement(p) => {
                let found = self
                    .find_element(&p.selector, command.optional, None)
                    .await?;
                self.driver
                    .tap_on_element(
                        &found.element,
                        &found.hierarchy,
                        p.long_press,
                        p.retry_if_no_change,
                        p.wait_until_visible,
                        p.repeat,
                        p.wait_to_settle_timeout_ms,
                        config.app_id.as_deref(),
                    )
                    .await?;
                Ok(true)
            }

            CommandKind::TapOnPoint { point } => {
                match parse_point(point)? {
                    PointSpec::Absolute(p) => self.driver.tap(p).await?,
                    PointSpec::Relative(x, y) => self.driver.tap_relative(x, y).await?,
                }
                Ok(true)
            }

            CommandKind::Swipe(p) => {
                self.swipe(p).await?;
                Ok(true)
            }

            CommandKind::InputText { text } => {
                if !self.driver.is_unicode_input_supported() && !text.is_ascii() {
                    return Err(FlowError::UnicodeNotSupported { text: text.clone() });
                }
                self.driver.input_text(text).await?;
                Ok(true)
            }

            CommandKind::EraseText { chars } => {
                self.driver.erase_text(chars.unwrap_or(ERASE_ALL_CHARS)).await?;
                Ok(true)
            }

            CommandKind::PressKey { code } => {
                self.driver.press_key(*code).await?;
                Ok(true)
            }

            CommandKind::HideKeyboard => {
                self.driver.hide_keyboard().await?;
                Ok(true)
            }

            CommandKind::Back => {
                self.driver.back_press().await?;
                Ok(true)
            }

            CommandKind::Scroll => {
                self.driver.scroll_vertical().await?;
                Ok(true)
            }

            CommandKind::ScrollUntilVisible(p) => {
                self.scroll_until_visible(command, p).await?;
                Ok(true)
            }

            CommandKind::CopyTextFrom { selector } => {
                let found = self.find_element(selector, command.optional, None).await?;
                let text = ["text", "hintText", "accessibilityText"]
                    .iter()
                    .filter_map(|a| found.element.attr(a))
                    .find(|v| !v.is_empty())
                    .map(|v| v.to_string())
                    .ok_or_else(|| FlowError::UnableToCopyTextFrom(selector.description()))?;
                self.copied_text = Some(text.clone());
                self.engine.set_copied_text(Some(text));
                Ok(false)
            }

            CommandKind::PasteText => {
                if let Some(text) = self.copied_text.clone() {
                    self.driver.input_text(&text).await?;
                    return Ok(true);
                }
                Ok(false)
            }

            CommandKind::OpenLink {
                link,
                auto_verify,
                browser,
            } => {
                self.driver
                    .open_link(link, config.app_id.as_deref(), *auto_verify, *browser)
                    .await?;
                Ok(true)
            }

            CommandKind::LaunchApp(p) => {
                self.launch_app(p).await?;
                Ok(true)
            }

            CommandKind::StopApp { app_id } => {
                let app_id = resolve_app_id(app_id, config)?;
                self.driver.stop_app(&app_id).await?;
                Ok(true)
            }

            CommandKind::KillApp { app_id } => {
                let app_id = resolve_app_id(app_id, config)?;
                self.driver.kill_app(&app_id).await?;
                Ok(true)
            }

            CommandKind::ClearState { app_id } => {
                let app_id = resolve_app_id(app_id, config)?;
                self.driver
                    .clear_app_state(&app_id)
                    .await
                    .map_err(|e| FlowError::UnableToClearState {
                        app_id: app_id.clone(),
                        reason: e.to_string(),
                    })?;
                // Cross-platform symmetry: clearing state also resets
                // permissions back to unset.
                let unset = HashMap::from([("all".to_string(), "unset".to_string())]);
                self.driver
                    .set_permissions(&app_id, &unset)
                    .await
                    .map_err(|e| FlowError::UnableToClearState {
                        app_id,
                        reason: e.to_string(),
                    })?;
                Ok(true)
            }

            CommandKind::ClearKeychain => {
                self.driver.clear_keychain().await?;
                Ok(true)
            }

            CommandKind::AssertCondition {
                condition,
                timeout_ms,
            } => {
                let timeout = timeout_ms.unwrap_or(self.lookup_timeout_ms);
                let holds = self
                    .evaluate_condition(condition, command.optional, Some(timeout))
                    .await?;
                if !holds {
                    let hierarchy = self.driver.view_hierarchy().await.ok().map(Box::new);
                    return Err(FlowError::AssertionFailure {
                        message: format!("Assertion is false: {}", condition.description()),
                        debug_message: assertion_debug_message(condition),
                        hierarchy,
                    });
                }
                Ok(false)
            }

            CommandKind::AssertWithAi { assertion } => {
                let ai = self.require_ai_engine()?;
                let screen = self.take_uncompressed_screenshot().await?;
                let defect = ai.perform_assertion(&screen, assertion).await?;
                if let Some(defect) = defect {
                    self.observer.on_command_generated_output(
                        command,
                        std::slice::from_ref(&defect),
                        &screen,
                    );
                    self.metadata.update(command, &*self.observer, |m| {
                        m.ai_reasoning = Some(defect.reasoning.clone());
                    });
                    return Err(FlowError::AssertionFailure {
                        message: format!("AI assertion failed: {assertion}"),
                        debug_message: defect.reasoning,
                        hierarchy: None,
                    });
                }
                Ok(false)
            }

            CommandKind::AssertNoDefectsWithAi => {
                let ai = self.require_ai_engine()?;
                let screen = self.take_uncompressed_screenshot().await?;
                let defects = ai.find_defects(&screen).await?;
                if !defects.is_empty() {
                    self.observer
                        .on_command_generated_output(command, &defects, &screen);
                    let reasoning = defects
                        .iter()
                        .map(|d| format!("{}: {}", d.category, d.reasoning))
                        .collect::<Vec<_>>()
                        .join("\n");
                    self.metadata.update(command, &*self.observer, |m| {
                        m.ai_reasoning = Some(reasoning.clone());
                    });
                    return Err(FlowError::AssertionFailure {
                        message: format!("{} defect(s) found on screen", defects.len()),
                        debug_message: reasoning,
                        hierarchy: None,
                    });
                }
                Ok(false)
            }

            CommandKind::ExtractTextWithAi {
                query,
                output_variable,
            } => {
                let ai = self.require_ai_engine()?;
                let screen = self.take_uncompressed_screenshot().await?;
                let text = ai.extract_text(&screen, query).await?;
                self.engine.put_env(output_variable, &text);
                Ok(false)
            }

            CommandKind::DefineVariables { env } => {
                for (name, value) in env {
                    self.engine.put_env(name, value);
                }
                Ok(false)
            }

            CommandKind::RunScript(p) => {
                self.engine
                    .evaluate_script(&p.script, &p.env, &p.source_name, true)?;
                Ok(true)
            }

            // The script already ran as part of the substitution pass.
            CommandKind::EvalScript { .. } => Ok(true),

            // Nested execution re-enters the command loop; boxing breaks the
            // future's size recursion.
            CommandKind::RunFlow(p) => {
                let mutated =
                    Box::pin(self.run_sub_flow(&p.commands, config, p.config.as_ref())).await?;
                Ok(mutated)
            }

            CommandKind::Repeat(p) => Box::pin(self.repeat(command, p, config)).await,

            CommandKind::Retry(p) => Box::pin(self.retry(command, p, config)).await,

            CommandKind::SetLocation { latitude, longitude } => {
                let lat = parse_coordinate(latitude, "latitude")?;
                let lon = parse_coordinate(longitude, "longitude")?;
                self.driver.set_location(lat, lon).await?;
                Ok(true)
            }

            CommandKind::SetOrientation { orientation } => {
                self.driver.set_orientation(*orientation).await?;
                Ok(true)
            }

            CommandKind::SetAirplaneMode { value } => {
                self.driver
                    .set_airplane_mode(*value == AirplaneValue::Enable)
                    .await?;
                Ok(true)
            }

            CommandKind::ToggleAirplaneMode => {
                let enabled = self.driver.is_airplane_mode_enabled().await?;
                self.driver.set_airplane_mode(!enabled).await?;
                Ok(true)
            }

            CommandKind::Travel(p) => {
                self.travel(p).await?;
                Ok(true)
            }

            CommandKind::TakeScreenshot { path } => {
                let mut out = Vec::new();
                self.driver.take_screenshot(&mut out, false).await?;
                std::fs::write(path, &out)
                    .map_err(|e| FlowError::Driver(anyhow::anyhow!(e)))?;
                Ok(false)
            }

            CommandKind::StartRecording { path } => {
                if self.screen_recording.is_none() {
                    let recording = self.driver.start_screen_recording(path).await?;
                    self.screen_recording = Some(recording);
                } else {
                    warn!("screen recording already active, ignoring startRecording");
                }
                Ok(true)
            }

            CommandKind::StopRecording => {
                self.close_screen_recording().await;
                Ok(true)
            }

            CommandKind::AddMedia { paths } => {
                self.driver.add_media(paths).await?;
                Ok(true)
            }

            CommandKind::WaitForAnimationToEnd { timeout_ms } => {
                self.driver.wait_for_animation_to_end(*timeout_ms).await?;
                Ok(false)
            }

            // Interpreted before execution; inert here.
            CommandKind::ApplyConfiguration { .. } => Ok(false),
        }
    }

    /// Decide the truth of a condition against the current UI, platform and
    /// script state. `timeout_ms` overrides the default optional lookup
    /// window; either is shortened by time already spent since the last
    /// interaction.
    pub(crate) async fn evaluate_condition(
        &mut self,
        condition: &Condition,
        command_optional: bool,
        timeout_ms: Option<u64>,
    ) -> Result<bool, FlowError> {
        if let Some(platform) = &condition.platform {
            let info = self.device_info().await?;
            if info.platform != *platform {
                return Ok(false);
            }
        }

        if let Some(selector) = &condition.visible {
            let timeout = self
                .adjusted_to_latest_interaction(timeout_ms.unwrap_or(self.optional_lookup_timeout_ms));
            match self.find_element(selector, command_optional, Some(timeout)).await {
                Ok(_) => {}
                Err(FlowError::ElementNotFound { .. }) => return Ok(false),
                Err(e) => return Err(e),
            }
        }

        if let Some(selector) = &condition.not_visible {
            let timeout = self
                .adjusted_to_latest_interaction(timeout_ms.unwrap_or(self.optional_lookup_timeout_ms));
            let deadline = Instant::now() + Duration::from_millis(timeout);
            let mut gone = false;
            loop {
                match self.find_element(selector, command_optional, Some(500)).await {
                    Err(FlowError::ElementNotFound { .. }) => {
                        gone = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
                if Instant::now() >= deadline {
                    break;
                }
            }
            if !gone {
                return Ok(false);
            }
        }

        if let Some(script_result) = &condition.script {
            if !is_truthy(script_result) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn swipe(&mut self, p: &SwipeParams) -> Result<(), FlowError> {
        if let (Some(start), Some(end)) = (p.start, p.end) {
            self.driver
                .swipe(start, end, p.duration_ms, p.wait_to_settle_timeout_ms)
                .await?;
        } else if let (Some(start), Some(end)) = (&p.start_relative, &p.end_relative) {
            let start = parse_percent_point(start)?;
            let end = parse_percent_point(end)?;
            self.driver
                .swipe_relative(start, end, p.duration_ms, p.wait_to_settle_timeout_ms)
                .await?;
        } else if let (Some(selector), Some(direction)) = (&p.selector, p.direction) {
            let found = self.find_element(selector, false, None).await?;
            let device = self.device_info().await?;
            let (cx, cy) = found
                .element
                .bounds()
                .map(|b| b.center())
                .unwrap_or((device.width_grid / 2, device.height_grid / 2));
            let end = match direction {
                SwipeDirection::Up => Point::new(cx, device.height_grid / 10),
                SwipeDirection::Down => Point::new(cx, device.height_grid * 9 / 10),
                SwipeDirection::Left => Point::new(device.width_grid / 10, cy),
                SwipeDirection::Right => Point::new(device.width_grid * 9 / 10, cy),
            };
            self.driver
                .swipe(
                    Point::new(cx, cy),
                    end,
                    p.duration_ms,
                    p.wait_to_settle_timeout_ms,
                )
                .await?;
        } else if let Some(direction) = p.direction {
            self.driver
                .swipe_direction(direction, p.duration_ms, p.wait_to_settle_timeout_ms)
                .await?;
        } else {
            return Err(FlowError::InvalidCommand(
                "swipe requires a direction, two points or an element".to_string(),
            ));
        }
        Ok(())
    }

    async fn launch_app(&mut self, p: &LaunchAppParams) -> Result<(), FlowError> {
        let clear_stage = async {
            if p.clear_keychain {
                self.driver.clear_keychain().await?;
            }
            if p.clear_state {
                self.driver.clear_app_state(&p.app_id).await?;
            }
            let permissions = p
                .permissions
                .clone()
                .unwrap_or_else(|| HashMap::from([("all".to_string(), "allow".to_string())]));
            self.driver.set_permissions(&p.app_id, &permissions).await
        };
        clear_stage
            .await
            .map_err(|e| FlowError::UnableToClearState {
                app_id: p.app_id.clone(),
                reason: e.to_string(),
            })?;

        self.driver
            .launch_app(&p.app_id, &p.launch_arguments, p.stop_app.unwrap_or(true))
            .await
            .map_err(|e| FlowError::UnableToLaunchApp {
                app_id: p.app_id.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn scroll_until_visible(
        &mut self,
        command: &Command,
        p: &ScrollUntilVisibleParams,
    ) -> Result<(), FlowError> {
        let timeout_ms = p.timeout_ms.unwrap_or(SCROLL_TIMEOUT_MS);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let swipe_duration = scroll_speed_to_duration(p.speed);
        let visibility_target = f64::from(p.visibility_percentage) / 100.0;
        let compiled = self.compile_selector(&p.selector).await?;
        let device = self.device_info().await?;

        let mut retries: u32 = 0;
        loop {
            let probe = match self.find_with_timeout(&compiled, 500).await {
                Ok(found) => Some(found),
                Err(FlowError::ElementNotFound { .. }) => None,
                Err(e) => return Err(e),
            };
            if let Some(found) = probe {
                if let Some(bounds) = found.element.bounds() {
                    let visible_pct =
                        bounds.visibility_percentage(device.width_grid, device.height_grid);

                    if p.center_element && visible_pct > 0.1 && retries <= 4 {
                        let (_, cy) = bounds.center();
                        let near_center =
                            (cy - device.height_grid / 2).abs() <= device.height_grid / 4;
                        if near_center {
                            return Ok(());
                        }
                    } else if visible_pct >= visibility_target {
                        return Ok(());
                    }
                }
            }

            self.driver
                .swipe_from_center(p.direction, swipe_duration, p.wait_to_settle_timeout_ms)
                .await?;
            retries += 1;

            if Instant::now() >= deadline {
                self.set_insight(
                    command,
                    InsightLevel::Warning,
                    format!(
                        "Could not bring element into view within {timeout_ms} ms after {retries} scroll attempts"
                    ),
                );
                return Err(FlowError::ElementNotFound {
                    description: compiled.description.clone(),
                    debug_message: format!(
                        "Could not bring [{}] into view within the {timeout_ms} ms timeout. \
                         Tuning knobs: increase timeout, adjust speed (currently {}), lower \
                         visibilityPercentage (currently {}), or toggle centerElement \
                         (currently {}).",
                        compiled.description, p.speed, p.visibility_percentage, p.center_element
                    ),
                    hierarchy: None,
                });
            }
        }
    }

    /// Nested execution with an isolated variable environment and the
    /// sub-flow's own lifecycle hooks. Returns whether any child mutated
    /// the device; failures propagate after the completion hook ran.
    pub(crate) async fn run_sub_flow(
        &mut self,
        commands: &[Command],
        config: &FlowConfig,
        subflow_config: Option<&FlowConfig>,
    ) -> Result<bool, FlowError> {
        self.engine.enter_env_scope();
        let result = self
            .run_sub_flow_scoped(commands, config, subflow_config)
            .await;
        self.engine.leave_env_scope();
        result
    }

    async fn run_sub_flow_scoped(
        &mut self,
        commands: &[Command],
        config: &FlowConfig,
        subflow_config: Option<&FlowConfig>,
    ) -> Result<bool, FlowError> {
        let defines: Vec<Command> = commands
            .iter()
            .filter(|c| matches!(c.kind, CommandKind::DefineVariables { .. }))
            .cloned()
            .collect();
        let filtered: Vec<Command> = commands
            .iter()
            .filter(|c| !matches!(c.kind, CommandKind::DefineVariables { .. }))
            .cloned()
            .collect();

        let mut mutated = false;
        if !defines.is_empty() {
            mutated |= self.execute_subflow_commands(&defines, config).await?;
        }

        let mut flow_err: Option<FlowError> = None;

        let on_start = subflow_config
            .map(|c| c.on_flow_start.as_slice())
            .unwrap_or_default();
        let start_ok = if on_start.is_empty() {
            true
        } else {
            match self.execute_subflow_commands(on_start, config).await {
                Ok(m) => {
                    mutated |= m;
                    true
                }
                Err(e) => {
                    flow_err = Some(e);
                    false
                }
            }
        };

        if start_ok {
            match self.execute_subflow_commands(&filtered, config).await {
                Ok(m) => mutated |= m,
                Err(e) => flow_err = Some(e),
            }
        }

        let on_complete = subflow_config
            .map(|c| c.on_flow_complete.as_slice())
            .unwrap_or_default();
        if !on_complete.is_empty() {
            match self.execute_subflow_commands(on_complete, config).await {
                Ok(m) => mutated |= m,
                Err(e) => {
                    if flow_err.is_none() {
                        flow_err = Some(e);
                    }
                }
            }
        }

        match flow_err {
            Some(e) => Err(e),
            None => Ok(mutated),
        }
    }

    /// Bounded conditional loop. Children are reset (observers told) before
    /// every iteration after the first; zero iterations reports as skipped.
    async fn repeat(
        &mut self,
        command: &Command,
        p: &RepeatParams,
        config: &FlowConfig,
    ) -> Result<bool, FlowError> {
        let max_runs: i64 = match &p.times {
            Some(times) => times.trim().parse().map_err(|_| {
                FlowError::InvalidCommand(format!("repeat times is not a number: {times}"))
            })?,
            None => i64::MAX,
        };

        let mut runs: i64 = 0;
        let mut mutated = false;
        while runs < max_runs {
            if let Some(condition) = &p.condition {
                // The loop condition sees per-iteration variable state.
                let evaluated = condition.evaluate_scripts(self.engine.as_mut())?;
                if !self.evaluate_condition(&evaluated, command.optional, None).await? {
                    break;
                }
            } else if p.times.is_none() {
                // No bound and no condition: nothing to drive the loop.
                break;
            }

            if runs > 0 {
                for child in command.children() {
                    self.reset_command(child);
                }
            }

            mutated |= self.execute_subflow_commands(&p.commands, config).await?;
            runs += 1;
            self.metadata.update(command, &*self.observer, |m| {
                m.number_of_runs = Some(runs as u32);
            });
        }

        if runs == 0 {
            return Err(FlowError::CommandSkipped);
        }
        Ok(mutated)
    }

    /// Bounded retry of a sub-flow: at most `min(maxRetries, 3) + 1`
    /// attempts, with a warning insight between attempts.
    async fn retry(
        &mut self,
        command: &Command,
        p: &RetryParams,
        config: &FlowConfig,
    ) -> Result<bool, FlowError> {
        let requested: u32 = match &p.max_retries {
            Some(n) => n.trim().parse().map_err(|_| {
                FlowError::InvalidCommand(format!("retry maxRetries is not a number: {n}"))
            })?,
            None => 1,
        };
        let max_retries = requested.min(3);

        let mut attempt: u32 = 0;
        loop {
            match self
                .run_sub_flow(&p.commands, config, p.config.as_ref())
                .await
            {
                Ok(mutated) => return Ok(mutated),
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    warn!(attempt, max_retries, "retrying after failure: {e}");
                    self.set_insight(
                        command,
                        InsightLevel::Warning,
                        format!("Attempt {attempt}/{max_retries} failed, retrying: {e}"),
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn travel(&mut self, p: &TravelParams) -> Result<(), FlowError> {
        if p.speed_mps <= 0.0 {
            return Err(FlowError::InvalidCommand(
                "travel speed must be positive".to_string(),
            ));
        }
        let mut previous = None;
        for point in &p.points {
            if self.cancellation.is_cancelled() {
                break;
            }
            if let Some(prev) = previous {
                let meters = haversine_distance_m(prev, *point);
                let duration = Duration::from_secs_f64(meters / p.speed_mps);
                tokio::time::sleep(duration).await;
            }
            self.driver
                .set_location(point.latitude, point.longitude)
                .await?;
            previous = Some(*point);
        }
        Ok(())
    }

    fn require_ai_engine(&self) -> Result<Arc<dyn AiEngine>, FlowError> {
        self.ai_engine
            .clone()
            .ok_or(FlowError::CloudApiKeyNotAvailable)
    }

    async fn take_uncompressed_screenshot(&mut self) -> Result<Vec<u8>, FlowError> {
        let mut out = Vec::new();
        self.driver.take_screenshot(&mut out, false).await?;
        Ok(out)
    }

    pub(crate) async fn device_info(&mut self) -> Result<DeviceInfo, FlowError> {
        if let Some(info) = &self.cached_device_info {
            return Ok(info.clone());
        }
        let info = self.driver.device_info().await?;
        self.cached_device_info = Some(info.clone());
        Ok(info)
    }

    /// Remaining wait budget: the requested timeout minus time already
    /// spent since the last device mutation.
    pub(crate) fn adjusted_to_latest_interaction(&self, timeout_ms: u64) -> u64 {
        let elapsed = self.time_of_last_interaction.elapsed().as_millis() as u64;
        timeout_ms.saturating_sub(elapsed)
    }

    /// Close the active screen recording, if any. Safe to call repeatedly.
    async fn close_screen_recording(&mut self) {
        if let Some(mut recording) = self.screen_recording.take() {
            if let Err(e) = recording.close().await {
                warn!("failed to close screen recording: {e}");
            }
        }
    }

    fn reset_command(&self, command: &Command) {
        self.observer.on_command_reset(command);
        for child in command.children() {
            self.reset_command(child);
        }
    }

    fn set_insight(&self, command: &Command, level: InsightLevel, message: impl Into<String>) {
        self.metadata.update(command, &*self.observer, |m| {
            m.insight = Some(Insight {
                level,
                message: message.into(),
            });
        });
    }

    fn install_log_sink(&mut self, raw: &Command) {
        let store = self.metadata.clone();
        let observer = self.observer.clone();
        let raw = raw.clone();
        self.engine.on_log_message(Box::new(move |message| {
            store.update(&raw, &*observer, |m| m.log_messages.push(message.clone()));
        }));
    }

    fn clear_log_sink(&mut self) {
        self.engine.on_log_message(Box::new(|_| {}));
    }
}

enum StepOutcome {
    Completed(bool),
    Warned,
    Skipped,
    Failed(FlowError),
}

enum PointSpec {
    Absolute(Point),
    Relative(i32, i32),
}

/// Parse `"x,y"` (pixels) or `"p%,p%"` (percent of screen, 0-100).
fn parse_point(point: &str) -> Result<PointSpec, FlowError> {
    let invalid = || FlowError::InvalidCommand(format!("invalid point: {point}"));
    let parts: Vec<&str> = point.split(',').map(str::trim).collect();
    if parts.len() != 2 {
        return Err(invalid());
    }

    if parts.iter().all(|p| p.ends_with('%')) {
        let (x, y) = parse_percent_point(point)?;
        Ok(PointSpec::Relative(x, y))
    } else {
        let x: i32 = parts[0].parse().map_err(|_| invalid())?;
        let y: i32 = parts[1].parse().map_err(|_| invalid())?;
        Ok(PointSpec::Absolute(Point::new(x, y)))
    }
}

/// Parse `"p%,p%"` with both values required to be within 0-100.
fn parse_percent_point(point: &str) -> Result<(i32, i32), FlowError> {
    let invalid = || FlowError::InvalidCommand(format!("invalid percent point: {point}"));
    let parts: Vec<&str> = point.split(',').map(str::trim).collect();
    if parts.len() != 2 {
        return Err(invalid());
    }
    let mut values = [0i32; 2];
    for (slot, part) in values.iter_mut().zip(&parts) {
        let raw = part.strip_suffix('%').ok_or_else(invalid)?;
        let value: i32 = raw.trim().parse().map_err(|_| invalid())?;
        if !(0..=100).contains(&value) {
            return Err(FlowError::InvalidCommand(format!(
                "percent out of range 0-100: {part}"
            )));
        }
        *slot = value;
    }
    Ok((values[0], values[1]))
}

fn parse_coordinate(value: &str, name: &str) -> Result<f64, FlowError> {
    value
        .trim()
        .parse()
        .map_err(|_| FlowError::InvalidCommand(format!("invalid {name}: {value}")))
}

fn resolve_app_id(app_id: &Option<String>, config: &FlowConfig) -> Result<String, FlowError> {
    app_id
        .clone()
        .or_else(|| config.app_id.clone())
        .ok_or_else(|| FlowError::InvalidCommand("no appId specified".to_string()))
}

/// Map a 0-100 speed to a swipe duration: faster means shorter swipes.
fn scroll_speed_to_duration(speed: u32) -> u64 {
    let clamped = speed.min(100) as u64;
    100 + (100 - clamped) * 9
}

fn assertion_debug_message(condition: &Condition) -> String {
    format!(
        "Assertion [{}] did not hold within the timeout. Check that the expected UI state is \
         reachable, increase timeout for slow screens, or relax the selector.",
        condition.description()
    )
}

/// Great-circle distance in meters between two waypoints.
fn haversine_distance_m(a: crate::command::GeoPoint, b: crate::command::GeoPoint) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}
