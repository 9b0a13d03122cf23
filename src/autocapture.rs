//! Autocapture of clicks, touches and other DOM interactions.
//!
//! Listeners are attached to an [`EventTarget`] (the document) in the capture phase. For every
//! interaction the element path is walked from the target up, turned into `$elements`
//! descriptors and captured as `$autocapture`.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, OnceLock, Weak,
};

use regex::Regex;
use serde_json::{Map, Value};

use crate::{core::TrackingCore, Properties};

/// Longest leaf text kept in `$el_text`.
const MAX_TEXT_LENGTH: usize = 200;

/// What kind of element this is, with the fields autocapture cares about.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(missing_docs)]
pub enum ElementKind {
    #[default]
    Generic,
    Input {
        input_type: String,
        name: String,
        value: String,
    },
    Select {
        name: String,
    },
    TextArea {
        name: String,
    },
    Button,
    Anchor {
        href: String,
    },
}

/// A DOM element as seen by autocapture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    tag_name: String,
    id: Option<String>,
    class_name: Option<String>,
    attributes: Vec<(String, String)>,
    text: Option<String>,
    single_text_child: bool,
    kind: ElementKind,
    parent: Option<Arc<Element>>,
}

impl Element {
    /// Create an element with `tag_name` and nothing else.
    pub fn new(tag_name: impl Into<String>) -> Element {
        Element {
            tag_name: tag_name.into(),
            ..Element::default()
        }
    }

    /// Set the `id`.
    pub fn with_id(mut self, id: impl Into<String>) -> Element {
        self.id = Some(id.into());
        self
    }

    /// Set the `class` attribute.
    pub fn with_class(mut self, class_name: impl Into<String>) -> Element {
        self.class_name = Some(class_name.into());
        self
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Element {
        self.attributes.push((name.into(), value.into()));
        self
    }

    /// Give the element a single text child.
    pub fn with_text(mut self, text: impl Into<String>) -> Element {
        self.text = Some(text.into());
        self.single_text_child = true;
        self
    }

    /// Set the text content without making it a single text child, e.g. for buttons with icons.
    pub fn with_text_content(mut self, text: impl Into<String>) -> Element {
        self.text = Some(text.into());
        self.single_text_child = false;
        self
    }

    /// Set the element kind.
    pub fn with_kind(mut self, kind: ElementKind) -> Element {
        self.kind = kind;
        self
    }

    /// Set the parent element.
    pub fn with_parent(mut self, parent: Arc<Element>) -> Element {
        self.parent = Some(parent);
        self
    }

    /// Value of attribute `name`.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Parent element.
    pub fn parent(&self) -> Option<&Element> {
        self.parent.as_deref()
    }

    fn ancestors(&self) -> impl Iterator<Item = &Element> {
        std::iter::successors(Some(self), |element| element.parent())
    }

    fn describe(&self) -> Map<String, Value> {
        let mut descriptor = Map::new();
        descriptor.insert(
            "tag_name".to_owned(),
            Value::from(self.tag_name.to_lowercase()),
        );

        if let Some(id) = self.id.as_deref().filter(|id| !id.is_empty()) {
            descriptor.insert("attr__id".to_owned(), Value::from(id));
        }
        if let Some(class_name) = self.class_name.as_deref().filter(|class| !class.is_empty()) {
            descriptor.insert("attr__class".to_owned(), Value::from(class_name));
        }
        for (name, value) in &self.attributes {
            if name.starts_with("data-") {
                descriptor.insert(format!("attr__{name}"), Value::from(value.as_str()));
            }
        }

        if self.single_text_child {
            if let Some(text) = self.text.as_deref().map(str::trim) {
                if !text.is_empty() && text.chars().count() < MAX_TEXT_LENGTH {
                    descriptor.insert("$el_text".to_owned(), Value::from(text));
                }
            }
        }

        match &self.kind {
            ElementKind::Input {
                input_type,
                name,
                value,
            } => {
                descriptor.insert("attr__type".to_owned(), Value::from(input_type.as_str()));
                descriptor.insert("attr__name".to_owned(), Value::from(name.as_str()));
                if input_type == "button" || input_type == "submit" {
                    descriptor.insert("$el_text".to_owned(), Value::from(value.as_str()));
                }
            }
            ElementKind::Select { name } => {
                descriptor.insert("attr__type".to_owned(), Value::from("select-one"));
                descriptor.insert("attr__name".to_owned(), Value::from(name.as_str()));
            }
            ElementKind::TextArea { name } => {
                descriptor.insert("attr__type".to_owned(), Value::from("textarea"));
                descriptor.insert("attr__name".to_owned(), Value::from(name.as_str()));
            }
            ElementKind::Button => {
                let text = self.text.as_deref().map(str::trim).unwrap_or_default();
                descriptor.insert("$el_text".to_owned(), Value::from(text));
            }
            ElementKind::Anchor { href } => {
                descriptor.insert("attr__href".to_owned(), Value::from(href.as_str()));
            }
            ElementKind::Generic => {}
        }

        descriptor
    }
}

/// Interaction details of a [`DomEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum DomEventKind {
    /// A mouse event at page coordinates.
    Mouse {
        /// Horizontal page coordinate.
        page_x: f64,
        /// Vertical page coordinate.
        page_y: f64,
    },
    /// A touch event with the page coordinates of the active touches.
    Touch {
        /// `(page_x, page_y)` of each active touch.
        touches: Vec<(f64, f64)>,
    },
    /// Anything else.
    Other,
}

/// A DOM event delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct DomEvent {
    /// DOM event type, e.g. `click`.
    pub event_type: String,
    /// Interaction details.
    pub kind: DomEventKind,
    /// Element the event was dispatched to. `None` for non-element targets.
    pub target: Option<Arc<Element>>,
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Event listener callback.
pub type Listener = Arc<dyn Fn(&DomEvent) + Send + Sync>;

/// Something listeners can be attached to, usually the document.
pub trait EventTarget: Send + Sync {
    /// Register `listener` for `event_type`.
    fn add_event_listener(&self, event_type: &str, listener: Listener, capture: bool) -> ListenerId;

    /// Unregister a listener. Unknown ids are ignored.
    fn remove_event_listener(&self, event_type: &str, id: ListenerId, capture: bool);
}

struct Registration {
    event_type: String,
    capture: bool,
    id: ListenerId,
    listener: Listener,
}

/// An in-memory [`EventTarget`] that delivers events through [`Document::dispatch`].
#[derive(Default)]
pub struct Document {
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Document {
    /// Create a document without listeners.
    pub fn new() -> Document {
        Document::default()
    }

    /// Deliver `event` to every listener registered for its type.
    pub fn dispatch(&self, event: &DomEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .expect("thread holding listeners lock should not panic")
            .iter()
            .filter(|registration| registration.event_type == event.event_type)
            .map(|registration| registration.listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .expect("thread holding listeners lock should not panic")
            .len()
    }
}

impl EventTarget for Document {
    fn add_event_listener(&self, event_type: &str, listener: Listener, capture: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .expect("thread holding listeners lock should not panic")
            .push(Registration {
                event_type: event_type.to_owned(),
                capture,
                id,
                listener,
            });
        id
    }

    fn remove_event_listener(&self, event_type: &str, id: ListenerId, capture: bool) {
        self.listeners
            .lock()
            .expect("thread holding listeners lock should not panic")
            .retain(|registration| {
                !(registration.id == id
                    && registration.capture == capture
                    && registration.event_type == event_type)
            });
    }
}

/// Autocapture settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AutocaptureOptions {
    /// Capture `touchend` as `touch`. Defaults to `true`.
    pub capture_touches: bool,
    /// `data-` attribute (without the prefix) that relabels an element and its descendants.
    pub custom_label_prop: String,
    /// Attribute that suppresses capture for an element and its descendants.
    pub no_capture_prop: String,
    /// Maximum number of elements in `$elements`.
    pub max_elements_captured: usize,
    /// Labels whose elements are never captured.
    pub ignore_labels: Vec<String>,
    /// Also capture submit, change, input, focus and blur.
    pub capture_all_dom_events: bool,
}

impl Default for AutocaptureOptions {
    fn default() -> AutocaptureOptions {
        AutocaptureOptions {
            capture_touches: true,
            custom_label_prop: "ph-label".to_owned(),
            no_capture_prop: "ph-no-capture".to_owned(),
            max_elements_captured: 20,
            ignore_labels: Vec::new(),
            capture_all_dom_events: false,
        }
    }
}

const EXTRA_DOM_EVENTS: &[&str] = &["submit", "change", "input", "focus", "blur"];

fn sanitize_label(label: &str) -> String {
    static NON_ALPHANUMERIC: OnceLock<Regex> = OnceLock::new();
    NON_ALPHANUMERIC
        .get_or_init(|| Regex::new("[^a-zA-Z0-9]+").expect("label pattern should be valid"))
        .replace_all(label, "-")
        .into_owned()
}

fn is_no_capture(element: &Element, options: &AutocaptureOptions) -> bool {
    element.attribute(&options.no_capture_prop).is_some()
        || element
            .attribute(&format!("data-{}", options.no_capture_prop))
            .is_some()
}

/// Build the `$elements` descriptors for an interaction on `target`.
///
/// Returns `None` when the interaction must not be captured.
pub(crate) fn element_path(target: &Element, options: &AutocaptureOptions) -> Option<Vec<Value>> {
    if target.ancestors().any(|element| is_no_capture(element, options)) {
        return None;
    }

    let mut elements: Vec<Map<String, Value>> = target
        .ancestors()
        .take(options.max_elements_captured)
        .map(Element::describe)
        .collect();

    let is_ignored = |label: &str| options.ignore_labels.iter().any(|ignored| ignored == label);

    // Walk from the outermost element down so a label covers everything below it.
    let label_attribute = format!("attr__data-{}", options.custom_label_prop);
    let mut last_label: Option<String> = None;
    for element in elements.iter_mut().rev() {
        if let Some(label) = element
            .get(&label_attribute)
            .and_then(Value::as_str)
            .filter(|label| !label.is_empty())
        {
            last_label = Some(label.to_owned());
        }
        if let Some(label) = last_label.as_deref().filter(|label| !is_ignored(label)) {
            element.insert("tag_name".to_owned(), Value::from(sanitize_label(label)));
        }
    }

    // `last_label` now holds the label resolved for the target itself.
    if last_label.as_deref().is_some_and(is_ignored) {
        return None;
    }

    let elements: Vec<Value> = elements
        .into_iter()
        .filter(|element| {
            !element
                .get("tag_name")
                .and_then(Value::as_str)
                .is_some_and(is_ignored)
        })
        .map(Value::Object)
        .collect();

    (!elements.is_empty()).then_some(elements)
}

fn interaction_properties(kind: &DomEventKind) -> Properties {
    let mut properties = Properties::new();
    match kind {
        DomEventKind::Mouse { page_x, page_y } => {
            properties.insert("$click_x".to_owned(), Value::from(*page_x));
            properties.insert("$click_y".to_owned(), Value::from(*page_y));
        }
        DomEventKind::Touch { touches } => {
            if let Some((page_x, page_y)) = touches.first() {
                properties.insert("$touch_x".to_owned(), Value::from(*page_x));
                properties.insert("$touch_y".to_owned(), Value::from(*page_y));
            }
        }
        DomEventKind::Other => {}
    }
    properties
}

fn listener(
    event_type: &'static str,
    core: Weak<dyn TrackingCore>,
    options: Arc<AutocaptureOptions>,
) -> Listener {
    Arc::new(move |event: &DomEvent| {
        let Some(target) = event.target.as_deref() else {
            return;
        };
        let Some(elements) = element_path(target, &options) else {
            log::trace!(target: "posthog", event_type; "interaction not captured");
            return;
        };
        if let Some(core) = core.upgrade() {
            core.autocapture(event_type, elements, interaction_properties(&event.kind));
        }
    })
}

/// Listeners registered by autocapture. [`AutocaptureHandle::detach`] removes them.
pub struct AutocaptureHandle {
    document: Arc<dyn EventTarget>,
    registrations: Mutex<Vec<(&'static str, ListenerId)>>,
}

impl AutocaptureHandle {
    /// Remove the listeners. Calling it again does nothing.
    pub fn detach(&self) {
        let registrations = std::mem::take(
            &mut *self
                .registrations
                .lock()
                .expect("thread holding registrations lock should not panic"),
        );
        for (dom_event, id) in registrations {
            self.document.remove_event_listener(dom_event, id, true);
        }
    }
}

/// Attach autocapture listeners to `document`, capturing into `core`.
pub(crate) fn attach(
    document: Arc<dyn EventTarget>,
    core: Weak<dyn TrackingCore>,
    options: AutocaptureOptions,
) -> AutocaptureHandle {
    let options = Arc::new(options);

    // (DOM event, captured event type)
    let mut events: Vec<(&'static str, &'static str)> = vec![("click", "click")];
    if options.capture_touches {
        events.push(("touchend", "touch"));
    }
    if options.capture_all_dom_events {
        events.extend(EXTRA_DOM_EVENTS.iter().map(|event| (*event, *event)));
    }

    let registrations = events
        .into_iter()
        .map(|(dom_event, event_type)| {
            let id = document.add_event_listener(
                dom_event,
                listener(event_type, core.clone(), options.clone()),
                true,
            );
            (dom_event, id)
        })
        .collect();

    AutocaptureHandle {
        document,
        registrations: Mutex::new(registrations),
    }
}
