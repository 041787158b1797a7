pub mod condition;

pub use condition::{is_truthy, Condition};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::driver::{DeviceOrientation, KeyCode, Point, SwipeDirection, TapRepeat};
use crate::error::FlowError;
use crate::script::ScriptEngine;
use crate::selector::ElementSelector;

/// Identity of a raw command. Metadata is keyed by this, not by structural
/// equality, so repeats and nested re-runs of the same command accumulate
/// into one entry while equal-looking commands stay distinct.
pub type CommandId = u64;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

fn next_command_id() -> CommandId {
    NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed)
}

/// One step of a flow: the shared envelope plus the kind-specific payload.
///
/// `optional` demotes domain failures to warnings; `condition` gates
/// execution; `label` overrides the generated description in reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(skip, default = "next_command_id")]
    pub id: CommandId,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub optional: bool,

    #[serde(default)]
    pub condition: Option<Condition>,

    pub kind: CommandKind,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            id: next_command_id(),
            label: None,
            optional: false,
            condition: None,
            kind,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn into_optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Sub-commands of composite kinds, for reset traversal. Leaves return
    /// an empty slice.
    pub fn children(&self) -> &[Command] {
        match &self.kind {
            CommandKind::RunFlow(p) => &p.commands,
            CommandKind::Repeat(p) => &p.commands,
            CommandKind::Retry(p) => &p.commands,
            _ => &[],
        }
    }

    /// Whether the command's own selector is marked optional.
    pub fn selector_optional(&self) -> bool {
        match &self.kind {
            CommandKind::TapOnElement(p) => p.selector.optional,
            CommandKind::ScrollUntilVisible(p) => p.selector.optional,
            CommandKind::CopyTextFrom { selector } => selector.optional,
            CommandKind::AssertCondition { condition, .. } => {
                condition.visible.as_ref().is_some_and(|s| s.optional)
                    || condition.not_visible.as_ref().is_some_and(|s| s.optional)
            }
            _ => false,
        }
    }

    /// Human-readable one-liner for reports and errors.
    pub fn describe(&self) -> String {
        match &self.kind {
            CommandKind::TapOnElement(p) => {
                if p.long_press {
                    format!("Long press on {}", p.selector.description())
                } else {
                    format!("Tap on {}", p.selector.description())
                }
            }
            CommandKind::TapOnPoint { point } => format!("Tap on point ({point})"),
            CommandKind::Swipe(p) => p.describe(),
            CommandKind::InputText { text } => format!("Input text \"{text}\""),
            CommandKind::EraseText { chars } => match chars {
                Some(n) => format!("Erase {n} characters"),
                None => "Erase text".to_string(),
            },
            CommandKind::PressKey { code } => format!("Press {code:?} key"),
            CommandKind::HideKeyboard => "Hide keyboard".to_string(),
            CommandKind::Back => "Press back".to_string(),
            CommandKind::Scroll => "Scroll vertically".to_string(),
            CommandKind::ScrollUntilVisible(p) => {
                format!("Scroll {:?} until {} is visible", p.direction, p.selector.description())
            }
            CommandKind::CopyTextFrom { selector } => {
                format!("Copy text from {}", selector.description())
            }
            CommandKind::PasteText => "Paste text".to_string(),
            CommandKind::OpenLink { link, .. } => format!("Open link {link}"),
            CommandKind::LaunchApp(p) => format!("Launch app {}", p.app_id),
            CommandKind::StopApp { app_id } => match app_id {
                Some(id) => format!("Stop app {id}"),
                None => "Stop app".to_string(),
            },
            CommandKind::KillApp { app_id } => match app_id {
                Some(id) => format!("Kill app {id}"),
                None => "Kill app".to_string(),
            },
            CommandKind::ClearState { app_id } => match app_id {
                Some(id) => format!("Clear state of {id}"),
                None => "Clear app state".to_string(),
            },
            CommandKind::ClearKeychain => "Clear keychain".to_string(),
            CommandKind::AssertCondition { condition, .. } => {
                format!("Assert that {}", condition.description())
            }
            CommandKind::AssertWithAi { assertion } => format!("Assert with AI: {assertion}"),
            CommandKind::AssertNoDefectsWithAi => "Assert no defects with AI".to_string(),
            CommandKind::ExtractTextWithAi { query, .. } => {
                format!("Extract text with AI: {query}")
            }
            CommandKind::DefineVariables { env } => {
                let mut names: Vec<&str> = env.keys().map(|k| k.as_str()).collect();
                names.sort_unstable();
                format!("Define variables: {}", names.join(", "))
            }
            CommandKind::RunScript(p) => format!("Run {}", p.source_name),
            CommandKind::EvalScript { script } => format!("Run {script}"),
            CommandKind::RunFlow(p) => format!("Run flow ({} commands)", p.commands.len()),
            CommandKind::Repeat(p) => match &p.times {
                Some(times) => format!("Repeat {times} times"),
                None => "Repeat while condition holds".to_string(),
            },
            CommandKind::Retry(p) => match &p.max_retries {
                Some(n) => format!("Retry up to {n} times"),
                None => "Retry".to_string(),
            },
            CommandKind::SetLocation { latitude, longitude } => {
                format!("Set location ({latitude}, {longitude})")
            }
            CommandKind::SetOrientation { orientation } => {
                format!("Set orientation {orientation:?}")
            }
            CommandKind::SetAirplaneMode { value } => format!("{value:?} airplane mode"),
            CommandKind::ToggleAirplaneMode => "Toggle airplane mode".to_string(),
            CommandKind::Travel(p) => format!("Travel along {} points", p.points.len()),
            CommandKind::TakeScreenshot { path } => format!("Take screenshot {path}"),
            CommandKind::StartRecording { path } => format!("Start recording {path}"),
            CommandKind::StopRecording => "Stop recording".to_string(),
            CommandKind::AddMedia { paths } => format!("Add {} media files", paths.len()),
            CommandKind::WaitForAnimationToEnd { .. } => "Wait for animation to end".to_string(),
            CommandKind::ApplyConfiguration { .. } => "Apply configuration".to_string(),
        }
    }

    /// The substitution pass: resolve `${…}` in every string field through
    /// the engine, returning an evaluated clone keyed by the same id.
    ///
    /// Children of composite commands are left untouched; they are
    /// substituted when their own turn comes, so loop variables observe
    /// per-iteration values. The repeat loop condition is deferred for the
    /// same reason.
    pub fn evaluate_scripts(&self, engine: &mut dyn ScriptEngine) -> Result<Command, FlowError> {
        // The envelope gate resolves here; Repeat's loop condition lives in
        // its params and is re-resolved per iteration instead.
        let condition = match &self.condition {
            Some(c) => Some(c.evaluate_scripts(engine)?),
            None => None,
        };

        let kind = match &self.kind {
            CommandKind::TapOnElement(p) => CommandKind::TapOnElement(TapElementParams {
                selector: evaluate_selector(&p.selector, engine)?,
                ..p.clone()
            }),
            CommandKind::TapOnPoint { point } => CommandKind::TapOnPoint {
                point: engine.evaluate_template(point)?,
            },
            CommandKind::Swipe(p) => CommandKind::Swipe(SwipeParams {
                selector: p
                    .selector
                    .as_ref()
                    .map(|s| evaluate_selector(s, &mut *engine))
                    .transpose()?,
                start_relative: eval_opt(&p.start_relative, engine)?,
                end_relative: eval_opt(&p.end_relative, engine)?,
                ..p.clone()
            }),
            CommandKind::InputText { text } => CommandKind::InputText {
                text: engine.evaluate_template(text)?,
            },
            CommandKind::ScrollUntilVisible(p) => {
                CommandKind::ScrollUntilVisible(ScrollUntilVisibleParams {
                    selector: evaluate_selector(&p.selector, engine)?,
                    ..p.clone()
                })
            }
            CommandKind::CopyTextFrom { selector } => CommandKind::CopyTextFrom {
                selector: evaluate_selector(selector, engine)?,
            },
            CommandKind::OpenLink {
                link,
                auto_verify,
                browser,
            } => CommandKind::OpenLink {
                link: engine.evaluate_template(link)?,
                auto_verify: *auto_verify,
                browser: *browser,
            },
            CommandKind::LaunchApp(p) => CommandKind::LaunchApp(LaunchAppParams {
                app_id: engine.evaluate_template(&p.app_id)?,
                launch_arguments: eval_map(&p.launch_arguments, engine)?,
                ..p.clone()
            }),
            CommandKind::StopApp { app_id } => CommandKind::StopApp {
                app_id: eval_opt(app_id, engine)?,
            },
            CommandKind::KillApp { app_id } => CommandKind::KillApp {
                app_id: eval_opt(app_id, engine)?,
            },
            CommandKind::ClearState { app_id } => CommandKind::ClearState {
                app_id: eval_opt(app_id, engine)?,
            },
            CommandKind::AssertCondition {
                condition,
                timeout_ms,
            } => CommandKind::AssertCondition {
                condition: condition.evaluate_scripts(engine)?,
                timeout_ms: *timeout_ms,
            },
            CommandKind::AssertWithAi { assertion } => CommandKind::AssertWithAi {
                assertion: engine.evaluate_template(assertion)?,
            },
            CommandKind::ExtractTextWithAi {
                query,
                output_variable,
            } => CommandKind::ExtractTextWithAi {
                query: engine.evaluate_template(query)?,
                output_variable: output_variable.clone(),
            },
            CommandKind::DefineVariables { env } => CommandKind::DefineVariables {
                env: eval_map(env, engine)?,
            },
            CommandKind::RunScript(p) => CommandKind::RunScript(RunScriptParams {
                env: eval_map(&p.env, engine)?,
                ..p.clone()
            }),
            CommandKind::EvalScript { script } => CommandKind::EvalScript {
                script: engine.evaluate_script(script, &Default::default(), "evalScript", false)?,
            },
            CommandKind::Repeat(p) => CommandKind::Repeat(RepeatParams {
                times: eval_opt(&p.times, engine)?,
                ..p.clone()
            }),
            CommandKind::Retry(p) => CommandKind::Retry(RetryParams {
                max_retries: eval_opt(&p.max_retries, engine)?,
                ..p.clone()
            }),
            CommandKind::SetLocation { latitude, longitude } => CommandKind::SetLocation {
                latitude: engine.evaluate_template(latitude)?,
                longitude: engine.evaluate_template(longitude)?,
            },
            CommandKind::TakeScreenshot { path } => CommandKind::TakeScreenshot {
                path: engine.evaluate_template(path)?,
            },
            CommandKind::StartRecording { path } => CommandKind::StartRecording {
                path: engine.evaluate_template(path)?,
            },
            CommandKind::AddMedia { paths } => CommandKind::AddMedia {
                paths: paths
                    .iter()
                    .map(|p| engine.evaluate_template(p))
                    .collect::<Result<_, _>>()?,
            },
            other => other.clone(),
        };

        Ok(Command {
            id: self.id,
            label: self.label.clone(),
            optional: self.optional,
            condition,
            kind,
        })
    }
}

/// Resolve `${…}` in a selector's string clauses, recursing into nested
/// selectors, and parse nothing — indexes stay strings until filter build.
pub(crate) fn evaluate_selector(
    selector: &ElementSelector,
    engine: &mut dyn ScriptEngine,
) -> Result<ElementSelector, FlowError> {
    fn eval_boxed(
        s: &Option<Box<ElementSelector>>,
        engine: &mut dyn ScriptEngine,
    ) -> Result<Option<Box<ElementSelector>>, FlowError> {
        s.as_ref()
            .map(|inner| evaluate_selector(inner, engine).map(Box::new))
            .transpose()
    }

    Ok(ElementSelector {
        text_regex: eval_opt(&selector.text_regex, engine)?,
        id_regex: eval_opt(&selector.id_regex, engine)?,
        css: eval_opt(&selector.css, engine)?,
        index: eval_opt(&selector.index, engine)?,
        below: eval_boxed(&selector.below, engine)?,
        above: eval_boxed(&selector.above, engine)?,
        left_of: eval_boxed(&selector.left_of, engine)?,
        right_of: eval_boxed(&selector.right_of, engine)?,
        child_of: eval_boxed(&selector.child_of, engine)?,
        contains_child: eval_boxed(&selector.contains_child, engine)?,
        contains_descendants: selector
            .contains_descendants
            .iter()
            .map(|s| evaluate_selector(s, &mut *engine))
            .collect::<Result<_, _>>()?,
        ..selector.clone()
    })
}

fn eval_opt(
    value: &Option<String>,
    engine: &mut dyn ScriptEngine,
) -> Result<Option<String>, FlowError> {
    value
        .as_ref()
        .map(|v| engine.evaluate_template(v))
        .transpose()
}

fn eval_map(
    map: &HashMap<String, String>,
    engine: &mut dyn ScriptEngine,
) -> Result<HashMap<String, String>, FlowError> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), engine.evaluate_template(v)?)))
        .collect()
}

/// The command taxonomy. Every variant carries its own parameters; shared
/// attributes live on the [`Command`] envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    // Interactions
    TapOnElement(TapElementParams),
    /// Point given as `"x,y"` in pixels or `"p%,p%"` of the screen.
    TapOnPoint { point: String },
    Swipe(SwipeParams),
    InputText { text: String },
    EraseText { chars: Option<u64> },
    PressKey { code: KeyCode },
    HideKeyboard,
    Back,
    Scroll,
    ScrollUntilVisible(ScrollUntilVisibleParams),

    // Clipboard
    CopyTextFrom { selector: ElementSelector },
    PasteText,

    // App lifecycle
    OpenLink {
        link: String,
        auto_verify: bool,
        browser: bool,
    },
    LaunchApp(LaunchAppParams),
    StopApp { app_id: Option<String> },
    KillApp { app_id: Option<String> },
    ClearState { app_id: Option<String> },
    ClearKeychain,

    // Assertions
    AssertCondition {
        condition: Condition,
        timeout_ms: Option<u64>,
    },
    AssertWithAi { assertion: String },
    AssertNoDefectsWithAi,
    ExtractTextWithAi {
        query: String,
        output_variable: String,
    },

    // Scripting
    DefineVariables { env: HashMap<String, String> },
    RunScript(RunScriptParams),
    EvalScript { script: String },

    // Control flow
    RunFlow(RunFlowParams),
    Repeat(RepeatParams),
    Retry(RetryParams),

    // Device state
    SetLocation {
        latitude: String,
        longitude: String,
    },
    SetOrientation { orientation: DeviceOrientation },
    SetAirplaneMode { value: AirplaneValue },
    ToggleAirplaneMode,
    Travel(TravelParams),

    // Media
    TakeScreenshot { path: String },
    StartRecording { path: String },
    StopRecording,
    AddMedia { paths: Vec<String> },

    WaitForAnimationToEnd { timeout_ms: Option<u64> },

    /// Flow header; interpreted before execution, a no-op when dispatched.
    ApplyConfiguration { config: FlowConfig },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapElementParams {
    pub selector: ElementSelector,
    #[serde(default = "default_true")]
    pub retry_if_no_change: bool,
    #[serde(default)]
    pub wait_until_visible: bool,
    #[serde(default)]
    pub long_press: bool,
    #[serde(default)]
    pub repeat: Option<TapRepeat>,
    #[serde(default)]
    pub wait_to_settle_timeout_ms: Option<u64>,
}

impl TapElementParams {
    pub fn new(selector: ElementSelector) -> Self {
        Self {
            selector,
            retry_if_no_change: true,
            wait_until_visible: false,
            long_press: false,
            repeat: None,
            wait_to_settle_timeout_ms: None,
        }
    }
}

/// Swipes accept four input shapes: a plain direction (from screen center),
/// two absolute points, a resolved element plus direction, or two
/// relative-percent points ("10%, 50%").
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwipeParams {
    pub direction: Option<SwipeDirection>,
    pub start: Option<Point>,
    pub end: Option<Point>,
    pub selector: Option<ElementSelector>,
    pub start_relative: Option<String>,
    pub end_relative: Option<String>,
    #[serde(default = "default_swipe_duration")]
    pub duration_ms: u64,
    pub wait_to_settle_timeout_ms: Option<u64>,
}

impl SwipeParams {
    fn describe(&self) -> String {
        if let (Some(start), Some(end)) = (&self.start, &self.end) {
            format!("Swipe from ({},{}) to ({},{})", start.x, start.y, end.x, end.y)
        } else if let (Some(s), Some(e)) = (&self.start_relative, &self.end_relative) {
            format!("Swipe from ({s}) to ({e})")
        } else if let (Some(sel), Some(d)) = (&self.selector, &self.direction) {
            format!("Swipe {d:?} on {}", sel.description())
        } else if let Some(d) = &self.direction {
            format!("Swipe {d:?}")
        } else {
            "Swipe".to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollUntilVisibleParams {
    pub selector: ElementSelector,
    #[serde(default = "default_scroll_direction")]
    pub direction: SwipeDirection,
    /// Whole-search deadline; defaults to 20 s.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 0-100; higher swipes faster (shorter swipe duration).
    #[serde(default = "default_scroll_speed")]
    pub speed: u32,
    /// 0-100; how much of the element must be on screen to count as found.
    #[serde(default = "default_visibility_percentage")]
    pub visibility_percentage: u8,
    /// Keep scrolling in small steps until the element sits near the
    /// screen center.
    #[serde(default)]
    pub center_element: bool,
    #[serde(default)]
    pub wait_to_settle_timeout_ms: Option<u64>,
}

impl ScrollUntilVisibleParams {
    pub fn new(selector: ElementSelector) -> Self {
        Self {
            selector,
            direction: default_scroll_direction(),
            timeout_ms: None,
            speed: default_scroll_speed(),
            visibility_percentage: default_visibility_percentage(),
            center_element: false,
            wait_to_settle_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchAppParams {
    pub app_id: String,
    #[serde(default)]
    pub clear_state: bool,
    #[serde(default)]
    pub clear_keychain: bool,
    /// Defaults to stopping a running instance.
    #[serde(default)]
    pub stop_app: Option<bool>,
    #[serde(default)]
    pub permissions: Option<HashMap<String, String>>,
    #[serde(default)]
    pub launch_arguments: HashMap<String, String>,
}

impl LaunchAppParams {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            clear_state: false,
            clear_keychain: false,
            stop_app: None,
            permissions: None,
            launch_arguments: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunScriptParams {
    /// Script source, executed (not parsed) by the engine.
    pub script: String,
    /// Name surfaced in script errors, usually the originating file.
    pub source_name: String,
    /// Extra bindings visible to this evaluation only.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFlowParams {
    pub commands: Vec<Command>,
    /// Nested flow's own lifecycle hooks.
    #[serde(default)]
    pub config: Option<FlowConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatParams {
    /// Iteration cap; unbounded when absent. Kept as a string so `${…}`
    /// can supply it.
    #[serde(default)]
    pub times: Option<String>,
    /// Loop condition, re-evaluated before every iteration.
    #[serde(default)]
    pub condition: Option<Condition>,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryParams {
    /// Capped at 3 regardless of the requested value.
    #[serde(default)]
    pub max_retries: Option<String>,
    pub commands: Vec<Command>,
    #[serde(default)]
    pub config: Option<FlowConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TravelParams {
    pub points: Vec<GeoPoint>,
    /// Meters per second.
    pub speed_mps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AirplaneValue {
    Enable,
    Disable,
}

/// Flow-level configuration snapshot carried by an ApplyConfiguration
/// command: app under test, lifecycle hooks, and free-form extension
/// options (`jsEngine`, `androidWebViewHierarchy`, ...).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowConfig {
    pub app_id: Option<String>,
    pub on_flow_start: Vec<Command>,
    pub on_flow_complete: Vec<Command>,
    pub ext: HashMap<String, String>,
}

impl FlowConfig {
    /// Snapshot the configuration of a command list: the first
    /// ApplyConfiguration wins, absence yields defaults.
    pub fn locate(commands: &[Command]) -> FlowConfig {
        commands
            .iter()
            .find_map(|c| match &c.kind {
                CommandKind::ApplyConfiguration { config } => Some(config.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

fn default_true() -> bool {
    true
}

fn default_swipe_duration() -> u64 {
    400
}

fn default_scroll_direction() -> SwipeDirection {
    SwipeDirection::Down
}

fn default_scroll_speed() -> u32 {
    40
}

fn default_visibility_percentage() -> u8 {
    100
}
