use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// How step output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners with a short tail of log lines, cleared when a step ends.
    Normal,
    /// Like `Normal`, but log lines stay on screen.
    Verbose,
    /// Nothing is drawn.
    Quiet,
    /// Plain lines without ANSI, for pipes.
    Plain,
}

const MAX_LOG_LINES: usize = 8;

/// Numbered steps of a long operation such as create.
pub struct StepProgress {
    multi: MultiProgress,
    total: usize,
    current: usize,
    mode: OutputMode,
}

/// Handle given to a running step.
pub struct Step {
    bar: ProgressBar,
    label: String,
    mode: OutputMode,
    state: Arc<Mutex<StepState>>,
}

#[derive(Default)]
struct StepState {
    tail: VecDeque<String>,
    done_label: Option<String>,
}

fn lock(state: &Mutex<StepState>) -> MutexGuard<'_, StepState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

impl StepProgress {
    pub fn new(total: usize, mode: OutputMode) -> Self {
        let multi = match mode {
            OutputMode::Plain | OutputMode::Quiet => {
                MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
            }
            _ => MultiProgress::new(),
        };
        Self {
            multi,
            total,
            current: 0,
            mode,
        }
    }

    fn next_prefix(&mut self) -> String {
        self.current += 1;
        format!("{}/{}", self.current, self.total)
    }

    /// Run `f` as the next numbered step: spinner while running, check mark
    /// when done. Finishing happens here so steps that never touch their
    /// [`Step`] still end cleanly.
    pub async fn run<F, Fut, T>(&mut self, label: &str, f: F) -> T
    where
        F: FnOnce(Step) -> Fut,
        Fut: Future<Output = T>,
    {
        let prefix = self.next_prefix();
        if self.mode == OutputMode::Plain {
            println!("[{prefix}] {label}");
        }

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(style("[{prefix}] {spinner:.cyan} {msg}"));
        bar.set_prefix(prefix.clone());
        bar.set_message(label.to_string());
        bar.enable_steady_tick(std::time::Duration::from_millis(80));

        let state = Arc::new(Mutex::new(StepState::default()));
        let result = f(Step {
            bar: bar.clone(),
            label: label.to_string(),
            mode: self.mode,
            state: state.clone(),
        })
        .await;

        let st = lock(&state);
        if self.mode == OutputMode::Verbose {
            for line in &st.tail {
                self.multi.println(format!("        {line}")).ok();
            }
        }
        let done = st.done_label.clone().unwrap_or_else(|| label.to_string());
        drop(st);

        if self.mode == OutputMode::Plain {
            println!("[{prefix}] \u{2713} {done}");
        }
        bar.set_style(style("[{prefix}] \u{2713} {msg:.green}"));
        bar.finish_with_message(done);
        result
    }

    /// A step with nothing to do, e.g. a cached image.
    pub fn skip(&mut self, label: &str) {
        let prefix = self.next_prefix();
        match self.mode {
            OutputMode::Plain => println!("[{prefix}] \u{2713} {label}"),
            OutputMode::Quiet => {}
            _ => {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(style("[{prefix}] \u{2713} {msg:.green}"));
                bar.set_prefix(prefix);
                bar.finish_with_message(label.to_string());
            }
        }
    }

    /// An indented note under the current step.
    pub fn info(&self, text: &str) {
        match self.mode {
            OutputMode::Plain => println!("      \u{2192} {text}"),
            OutputMode::Quiet => {}
            _ => {
                self.multi.println(format!("      \u{2192} {text}")).ok();
            }
        }
    }
}

impl Step {
    /// Show a line under the spinner. Only the last few are kept.
    pub fn log(&self, line: &str) {
        match self.mode {
            OutputMode::Quiet => return,
            OutputMode::Plain => {
                for sub in line.lines() {
                    println!("        {sub}");
                }
                return;
            }
            _ => {}
        }

        let mut st = lock(&self.state);
        for sub in line.lines() {
            if st.tail.len() >= MAX_LOG_LINES {
                st.tail.pop_front();
            }
            st.tail.push_back(sub.to_string());
        }

        // Extra lines ride in the bar's own message so indicatif keeps its
        // line count right when redrawing.
        let mut msg = self.label.clone();
        for l in &st.tail {
            msg.push_str("\n        ");
            msg.push_str(l);
        }
        self.bar.set_message(msg);
    }

    pub fn set_done_label(&self, label: impl Into<String>) {
        lock(&self.state).done_label = Some(label.into());
    }
}
