/*!
 * Navigation state machine
 *
 * Five states (following, deviating, returning, blocked, stopped) with an
 * explicit transition table. The machine is the only place motion commands
 * are produced; every command passes a final costmap safety gate.
 *
 * All cross-tick navigation state lives in `NavContext`, which the control
 * loop owns and passes into each step.
 */

use std::collections::VecDeque;
use std::fmt;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::common::{ControlInput, CostQuery, NavError, NavResult, Point2D, StampedPose, Timestamp};
use crate::mapping::SensorHealth;
use crate::path_planning::{BlockedSegment, Decision, DetourPlan, DeviationPlanner, PlannerConfig, Route, Side};
use crate::path_tracking::{pure_pursuit_steer_control, route_target, ReturnConfig, ReturnController, ReturnStep};
use crate::perception::TrackSnapshot;

const HISTORY_CAPACITY: usize = 256;

/// Plain discriminant of `NavState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavStateKind {
    Following,
    Deviating,
    Returning,
    Blocked,
    Stopped,
}

impl NavStateKind {
    pub const ALL: [NavStateKind; 5] = [
        NavStateKind::Following,
        NavStateKind::Deviating,
        NavStateKind::Returning,
        NavStateKind::Blocked,
        NavStateKind::Stopped,
    ];

    /// Whether `event` may move the machine from `self` to `to`.
    pub fn can_transition(self, event: NavEvent, to: NavStateKind) -> bool {
        if to == NavStateKind::Stopped {
            return event.is_stop();
        }
        if to == NavStateKind::Following && event == NavEvent::RouteReplaced {
            return true;
        }
        TRANSITIONS
            .iter()
            .any(|&(f, e, t)| f == self && e == event && t == to)
    }
}

impl fmt::Display for NavStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NavStateKind::Following => "FOLLOWING",
            NavStateKind::Deviating => "DEVIATING",
            NavStateKind::Returning => "RETURNING",
            NavStateKind::Blocked => "BLOCKED",
            NavStateKind::Stopped => "STOPPED",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    Operator,
    PoseLost,
    NoRoute,
    InvalidRoute,
    GoalReached,
    Fault,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::Operator => "operator",
            StopReason::PoseLost => "pose_lost",
            StopReason::NoRoute => "no_route",
            StopReason::InvalidRoute => "invalid_route",
            StopReason::GoalReached => "goal_reached",
            StopReason::Fault => "fault",
        };
        write!(f, "{}", name)
    }
}

/// What caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavEvent {
    DetourPlanned,
    NoDetour,
    DetourComplete,
    Rejoined,
    RejoinBlocked,
    DetourInvalidated,
    PathClear,
    Reset,
    RouteReplaced,
    Stop(StopReason),
}

impl NavEvent {
    pub fn is_stop(&self) -> bool {
        matches!(self, NavEvent::Stop(_))
    }
}

impl fmt::Display for NavEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NavEvent::DetourPlanned => write!(f, "detour_planned"),
            NavEvent::NoDetour => write!(f, "no_detour"),
            NavEvent::DetourComplete => write!(f, "detour_complete"),
            NavEvent::Rejoined => write!(f, "rejoined"),
            NavEvent::RejoinBlocked => write!(f, "rejoin_blocked"),
            NavEvent::DetourInvalidated => write!(f, "detour_invalidated"),
            NavEvent::PathClear => write!(f, "path_clear"),
            NavEvent::Reset => write!(f, "reset"),
            NavEvent::RouteReplaced => write!(f, "route_replaced"),
            NavEvent::Stop(reason) => write!(f, "stop({})", reason),
        }
    }
}

// Transitions besides "any -> STOPPED" and "route replaced -> FOLLOWING".
const TRANSITIONS: &[(NavStateKind, NavEvent, NavStateKind)] = &[
    (NavStateKind::Following, NavEvent::DetourPlanned, NavStateKind::Deviating),
    (NavStateKind::Following, NavEvent::NoDetour, NavStateKind::Blocked),
    (NavStateKind::Deviating, NavEvent::DetourComplete, NavStateKind::Returning),
    (NavStateKind::Returning, NavEvent::Rejoined, NavStateKind::Following),
    (NavStateKind::Returning, NavEvent::RejoinBlocked, NavStateKind::Deviating),
    (NavStateKind::Blocked, NavEvent::PathClear, NavStateKind::Following),
    (NavStateKind::Deviating, NavEvent::DetourInvalidated, NavStateKind::Deviating),
    (NavStateKind::Returning, NavEvent::DetourInvalidated, NavStateKind::Deviating),
    (NavStateKind::Deviating, NavEvent::NoDetour, NavStateKind::Blocked),
    (NavStateKind::Returning, NavEvent::NoDetour, NavStateKind::Blocked),
    (NavStateKind::Blocked, NavEvent::DetourPlanned, NavStateKind::Deviating),
    (NavStateKind::Stopped, NavEvent::Reset, NavStateKind::Following),
];

/// Text rendering of the transition table.
pub fn transition_diagram() -> String {
    let mut diagram = Vec::new();
    diagram.push("States:".to_string());
    for kind in NavStateKind::ALL {
        diagram.push(format!("  - {}", kind));
    }
    diagram.push("".to_string());
    diagram.push("Transitions:".to_string());
    for (from, event, to) in TRANSITIONS {
        diagram.push(format!("  {} --[{}]--> {}", from, event, to));
    }
    diagram.push("  * --[route_replaced]--> FOLLOWING".to_string());
    diagram.push("  * --[stop(..)]--> STOPPED".to_string());
    diagram.join("\n")
}

/// Navigation state. An active detour lives inside its variant, so there is
/// never more than one.
#[derive(Debug, Clone, PartialEq)]
pub enum NavState {
    Following,
    Deviating(DetourPlan),
    Returning(DetourPlan),
    Blocked(BlockedSegment),
    Stopped(StopReason),
}

impl NavState {
    pub fn kind(&self) -> NavStateKind {
        match self {
            NavState::Following => NavStateKind::Following,
            NavState::Deviating(_) => NavStateKind::Deviating,
            NavState::Returning(_) => NavStateKind::Returning,
            NavState::Blocked(_) => NavStateKind::Blocked,
            NavState::Stopped(_) => NavStateKind::Stopped,
        }
    }

    pub fn active_detour(&self) -> Option<&DetourPlan> {
        match self {
            NavState::Deviating(plan) | NavState::Returning(plan) => Some(plan),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, NavState::Stopped(_))
    }
}

impl fmt::Display for NavState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NavState::Stopped(reason) => write!(f, "STOPPED({})", reason),
            NavState::Blocked(segment) => write!(f, "BLOCKED {}", segment),
            other => write!(f, "{}", other.kind()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionRecord {
    pub tick: u64,
    pub stamp: Timestamp,
    pub from: NavStateKind,
    pub event: NavEvent,
    pub to: NavStateKind,
}

/// Command sent to the motion layer, exactly one per tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionCommand {
    Goto { target: Point2D, control: ControlInput },
    Stop,
}

impl MotionCommand {
    pub fn is_stop(&self) -> bool {
        matches!(self, MotionCommand::Stop)
    }

    pub fn target(&self) -> Option<Point2D> {
        match self {
            MotionCommand::Goto { target, .. } => Some(*target),
            MotionCommand::Stop => None,
        }
    }

    pub fn control(&self) -> ControlInput {
        match self {
            MotionCommand::Goto { control, .. } => *control,
            MotionCommand::Stop => ControlInput::zero(),
        }
    }
}

/// Monitoring view of the active detour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetourSummary {
    pub origin_s: f64,
    pub rejoin_s: f64,
    pub side: Side,
    pub lateral_offset: f64,
    pub waypoints: usize,
    pub created_at: Timestamp,
}

impl From<&DetourPlan> for DetourSummary {
    fn from(plan: &DetourPlan) -> Self {
        Self {
            origin_s: plan.origin_s,
            rejoin_s: plan.rejoin_s,
            side: plan.side,
            lateral_offset: plan.lateral_offset,
            waypoints: plan.waypoints.len(),
            created_at: plan.created_at,
        }
    }
}

/// Published every tick for external monitoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavStatus {
    pub state: NavStateKind,
    pub active_detour: Option<DetourSummary>,
    pub blocked: Option<BlockedSegment>,
    pub current_s: f64,
    pub health: SensorHealth,
    pub tick: u64,
}

/// Navigation context owned by the control loop.
#[derive(Debug, Clone)]
pub struct NavContext {
    route: Option<Route>,
    state: NavState,
    current_s: f64,
    tick: u64,
    history: VecDeque<TransitionRecord>,
    recent_positions: VecDeque<Point2D>,
    relocalize: bool,
    blind: bool,
    detours_created: u64,
    // bumped on every route replacement or reset
    generation: u64,
}

impl NavContext {
    /// Context following `route` from its start.
    pub fn new(route: Route) -> Self {
        Self::with_state(Some(route), NavState::Following)
    }

    /// Context without a route; stays stopped until one is assigned.
    pub fn idle() -> Self {
        Self::with_state(None, NavState::Stopped(StopReason::NoRoute))
    }

    fn with_state(route: Option<Route>, state: NavState) -> Self {
        Self {
            route,
            state,
            current_s: 0.0,
            tick: 0,
            history: VecDeque::new(),
            recent_positions: VecDeque::new(),
            relocalize: true,
            blind: false,
            detours_created: 0,
            generation: 0,
        }
    }

    pub fn state(&self) -> &NavState {
        &self.state
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn current_s(&self) -> f64 {
        self.current_s
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn detours_created(&self) -> u64 {
        self.detours_created
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    /// Replace the route. A malformed route is rejected and the context stops.
    pub fn assign_route(&mut self, points: &[Point2D], now: Timestamp) -> NavResult<()> {
        self.generation += 1;
        match Route::new(points) {
            Ok(route) => {
                info!("route assigned: {} waypoints, {:.2} m", route.waypoints().len(), route.length());
                self.route = Some(route);
                self.current_s = 0.0;
                self.relocalize = true;
                self.transition(NavState::Following, NavEvent::RouteReplaced, now)
            }
            Err(e) => {
                warn!("route rejected: {}", e);
                self.route = None;
                self.force_stop(StopReason::InvalidRoute, now);
                Err(e)
            }
        }
    }

    /// Leave STOPPED and resume following the current route.
    pub fn reset(&mut self, now: Timestamp) -> NavResult<()> {
        if self.route.is_none() {
            return Err(NavError::InvalidRoute("no route assigned".to_string()));
        }
        if !self.state.is_stopped() {
            return Ok(());
        }
        self.relocalize = true;
        self.generation += 1;
        self.transition(NavState::Following, NavEvent::Reset, now)
    }

    pub fn status(&self, health: SensorHealth) -> NavStatus {
        NavStatus {
            state: self.state.kind(),
            active_detour: self.state.active_detour().map(DetourSummary::from),
            blocked: self.route.as_ref().and_then(|r| r.blocked().copied()),
            current_s: self.current_s,
            health,
            tick: self.tick,
        }
    }

    /// Move to `to`, checked against the transition table.
    pub(crate) fn transition(&mut self, to: NavState, event: NavEvent, now: Timestamp) -> NavResult<()> {
        let from = self.state.kind();
        let to_kind = to.kind();
        if !from.can_transition(event, to_kind) {
            return Err(NavError::InvalidTransition { from, to: to_kind });
        }
        if to_kind == NavStateKind::Deviating {
            self.detours_created += 1;
        }
        info!("{} --[{}]--> {}", from, event, to);
        self.history.push_back(TransitionRecord {
            tick: self.tick,
            stamp: now,
            from,
            event,
            to: to_kind,
        });
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.state = to;
        self.recent_positions.clear();
        Ok(())
    }

    pub(crate) fn force_stop(&mut self, reason: StopReason, now: Timestamp) {
        if self.state == NavState::Stopped(reason) {
            return;
        }
        if let Err(e) = self.transition(NavState::Stopped(reason), NavEvent::Stop(reason), now) {
            error!("stop rejected: {}", e);
            self.state = NavState::Stopped(reason);
        }
    }

    fn push_position(&mut self, p: Point2D, window: usize) {
        self.recent_positions.push_back(p);
        while self.recent_positions.len() > window.max(1) {
            self.recent_positions.pop_front();
        }
    }

    fn is_stuck(&self, window: usize, min_displacement: f64) -> bool {
        match (self.recent_positions.front(), self.recent_positions.back()) {
            (Some(first), Some(last)) if self.recent_positions.len() >= window.max(2) => {
                first.distance(last) < min_displacement
            }
            _ => false,
        }
    }

    /// Transition history as text, oldest first.
    pub fn render_history(&self) -> String {
        let mut lines = vec![format!("Current State: {}", self.state), "".to_string()];
        lines.push("History:".to_string());
        for r in &self.history {
            lines.push(format!("  [{:>5}] t={:>8.2}  {} --[{}]--> {}", r.tick, r.stamp, r.from, r.event, r.to));
        }
        lines.join("\n")
    }
}

/// State machine configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct MachineConfig {
    /// Distance to the route end that counts as arrived (meters)
    #[serde(default = "default_goal_tolerance")]
    pub goal_tolerance: f64,
    /// Maximum pose age before the pose counts as lost (seconds)
    #[serde(default = "default_pose_timeout")]
    pub pose_timeout: f64,
    /// Consecutive clear evaluations before leaving BLOCKED
    #[serde(default = "default_clear_persistence_ticks")]
    pub clear_persistence_ticks: u32,
    /// Ticks over which detour progress is measured
    #[serde(default = "default_stuck_window_ticks")]
    pub stuck_window_ticks: usize,
    /// Displacement below which a detour counts as stalled (meters)
    #[serde(default = "default_stuck_distance")]
    pub stuck_distance: f64,
    /// Route window searched around the last arc length when projecting the pose (meters)
    #[serde(default = "default_projection_window")]
    pub projection_window: f64,
}

fn default_goal_tolerance() -> f64 {
    0.3
}
fn default_pose_timeout() -> f64 {
    0.5
}
fn default_clear_persistence_ticks() -> u32 {
    3
}
fn default_stuck_window_ticks() -> usize {
    30
}
fn default_stuck_distance() -> f64 {
    0.1
}
fn default_projection_window() -> f64 {
    2.0
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            goal_tolerance: default_goal_tolerance(),
            pose_timeout: default_pose_timeout(),
            clear_persistence_ticks: default_clear_persistence_ticks(),
            stuck_window_ticks: default_stuck_window_ticks(),
            stuck_distance: default_stuck_distance(),
            projection_window: default_projection_window(),
        }
    }
}

impl MachineConfig {
    pub fn validate(&self) -> NavResult<()> {
        if !(self.goal_tolerance > 0.0) || !(self.pose_timeout > 0.0) || !(self.projection_window > 0.0) {
            return Err(NavError::Config(
                "goal_tolerance, pose_timeout and projection_window must be positive".to_string(),
            ));
        }
        if self.clear_persistence_ticks == 0 || self.stuck_window_ticks < 2 {
            return Err(NavError::Config(
                "clear_persistence_ticks must be >= 1 and stuck_window_ticks >= 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything a step reads besides the context.
pub struct StepInput<'a, C: CostQuery> {
    pub costmap: &'a C,
    pub obstacles: &'a TrackSnapshot,
    pub pose: Option<&'a StampedPose>,
    pub health: SensorHealth,
    pub stop_requested: bool,
    pub now: Timestamp,
}

// Command for this tick plus an optional transition to apply.
struct Outcome {
    command: MotionCommand,
    next: Option<(NavState, NavEvent)>,
}

impl Outcome {
    fn stay(command: MotionCommand) -> Self {
        Self { command, next: None }
    }

    fn go(command: MotionCommand, state: NavState, event: NavEvent) -> Self {
        Self {
            command,
            next: Some((state, event)),
        }
    }
}

pub struct NavigationStateMachine {
    config: MachineConfig,
    planner: DeviationPlanner,
    controller: ReturnController,
    clear_ticks: u32,
    // context generation the counters above belong to
    generation: Option<u64>,
}

impl NavigationStateMachine {
    pub fn new(config: MachineConfig, planner: PlannerConfig, controller: ReturnConfig) -> NavResult<Self> {
        config.validate()?;
        let controller = ReturnController::new(controller, &planner)?;
        Ok(Self {
            config,
            planner: DeviationPlanner::new(planner)?,
            controller,
            clear_ticks: 0,
            generation: None,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn planner(&self) -> &DeviationPlanner {
        &self.planner
    }

    /// Advance one tick and return the command for it.
    pub fn step<C: CostQuery>(&mut self, ctx: &mut NavContext, input: &StepInput<'_, C>) -> MotionCommand {
        ctx.tick += 1;
        let now = input.now;

        if input.stop_requested {
            ctx.force_stop(StopReason::Operator, now);
        }
        if ctx.state.is_stopped() {
            return MotionCommand::Stop;
        }
        if self.generation != Some(ctx.generation) {
            debug!("route generation {}, dropping detour progress", ctx.generation);
            self.generation = Some(ctx.generation);
            self.forget_progress();
        }

        let pose = match input.pose {
            Some(p) if p.age(now) <= self.config.pose_timeout && p.pose.is_finite() => *p,
            _ => {
                warn!("pose missing or stale at t={:.2}", now);
                self.halt(ctx, StopReason::PoseLost, now);
                return MotionCommand::Stop;
            }
        };
        let Some(mut route) = ctx.route.take() else {
            self.halt(ctx, StopReason::NoRoute, now);
            return MotionCommand::Stop;
        };

        let command = self.run(ctx, &mut route, &pose, input);
        ctx.route = Some(route);
        command
    }

    fn run<C: CostQuery>(
        &mut self,
        ctx: &mut NavContext,
        route: &mut Route,
        pose: &StampedPose,
        input: &StepInput<'_, C>,
    ) -> MotionCommand {
        let now = input.now;
        let position = pose.position();
        let (s, _) = if ctx.relocalize {
            route.project(position)
        } else {
            route.to_frenet(position, ctx.current_s, self.config.projection_window)
        };
        ctx.relocalize = false;
        ctx.current_s = s;
        ctx.push_position(position, self.config.stuck_window_ticks);

        if route.length() - s <= self.config.goal_tolerance
            && position.distance(&route.end()) <= self.config.goal_tolerance
        {
            info!("goal reached at t={:.2}", now);
            self.halt(ctx, StopReason::GoalReached, now);
            return MotionCommand::Stop;
        }

        if input.health.is_blind() {
            if !ctx.blind {
                warn!("no usable sensing modality, holding position");
            }
            ctx.blind = true;
            return MotionCommand::Stop;
        }
        ctx.blind = false;

        let outcome = match &ctx.state {
            NavState::Following => self.on_following(ctx, route, pose, input),
            NavState::Deviating(plan) => self.on_deviating(ctx, route, plan, pose, input),
            NavState::Returning(plan) => self.on_returning(ctx, route, plan, pose, input),
            NavState::Blocked(_) => self.on_blocked(ctx, route, pose, input),
            NavState::Stopped(_) => Outcome::stay(MotionCommand::Stop),
        };

        let mut command = outcome.command;
        if let Some((next, event)) = outcome.next {
            match &next {
                NavState::Blocked(segment) => route.annotate_blocked(*segment),
                NavState::Deviating(plan) => match plan.blocked {
                    Some(segment) => route.annotate_blocked(segment),
                    None => route.clear_blocked(),
                },
                NavState::Following => route.clear_blocked(),
                _ => {}
            }
            if !matches!(next, NavState::Following | NavState::Blocked(_)) {
                self.clear_ticks = 0;
            }
            if let Err(e) = ctx.transition(next, event, now) {
                error!("navigation fault: {}", e);
                self.halt(ctx, StopReason::Fault, now);
                command = MotionCommand::Stop;
            }
        }
        self.safety_gate(command, pose, input.costmap)
    }

    fn on_following<C: CostQuery>(
        &mut self,
        ctx: &NavContext,
        route: &Route,
        pose: &StampedPose,
        input: &StepInput<'_, C>,
    ) -> Outcome {
        match self
            .planner
            .evaluate(route, ctx.current_s, input.costmap, input.obstacles, input.now)
        {
            Decision::Clear => Outcome::stay(self.follow_route(route, ctx.current_s, pose)),
            Decision::Blocked(segment) if !segment.confirmed => {
                Outcome::stay(self.follow_route(route, ctx.current_s, pose))
            }
            Decision::Blocked(segment) => {
                Outcome::go(MotionCommand::Stop, NavState::Blocked(segment), NavEvent::NoDetour)
            }
            Decision::Detour(plan) => self.start_detour(route, plan, pose, input, NavEvent::DetourPlanned),
        }
    }

    fn on_deviating<C: CostQuery>(
        &mut self,
        ctx: &NavContext,
        route: &Route,
        plan: &DetourPlan,
        pose: &StampedPose,
        input: &StepInput<'_, C>,
    ) -> Outcome {
        let step = self.controller.step(plan, route, input.costmap, pose, input.now);
        let stuck = ctx.is_stuck(self.config.stuck_window_ticks, self.config.stuck_distance);
        if step.path_blocked || stuck {
            info!(
                "detour invalidated: {}",
                if stuck { "no progress" } else { "path ahead blocked" }
            );
            return self.replan(ctx, route, pose, input, NavEvent::DetourInvalidated);
        }
        if step.detour_complete {
            return Outcome::go(command_for(&step), NavState::Returning(plan.clone()), NavEvent::DetourComplete);
        }
        Outcome::stay(command_for(&step))
    }

    fn on_returning<C: CostQuery>(
        &mut self,
        ctx: &NavContext,
        route: &Route,
        plan: &DetourPlan,
        pose: &StampedPose,
        input: &StepInput<'_, C>,
    ) -> Outcome {
        let step = self.controller.step(plan, route, input.costmap, pose, input.now);
        if step.rejoined {
            self.planner.reset_persistence();
            self.controller.reset();
            return Outcome::go(
                self.follow_route(route, ctx.current_s, pose),
                NavState::Following,
                NavEvent::Rejoined,
            );
        }
        if step.replan_required {
            let event = if step.rejoin_clear {
                NavEvent::DetourInvalidated
            } else {
                NavEvent::RejoinBlocked
            };
            return self.replan(ctx, route, pose, input, event);
        }
        Outcome::stay(command_for(&step))
    }

    fn on_blocked<C: CostQuery>(
        &mut self,
        ctx: &NavContext,
        route: &Route,
        pose: &StampedPose,
        input: &StepInput<'_, C>,
    ) -> Outcome {
        match self
            .planner
            .evaluate(route, ctx.current_s, input.costmap, input.obstacles, input.now)
        {
            Decision::Clear => {
                self.clear_ticks += 1;
                if self.clear_ticks < self.config.clear_persistence_ticks {
                    debug!("route reads clear ({}/{})", self.clear_ticks, self.config.clear_persistence_ticks);
                    return Outcome::stay(MotionCommand::Stop);
                }
                self.clear_ticks = 0;
                self.planner.reset_persistence();
                Outcome::go(self.follow_route(route, ctx.current_s, pose), NavState::Following, NavEvent::PathClear)
            }
            Decision::Blocked(_) => {
                self.clear_ticks = 0;
                Outcome::stay(MotionCommand::Stop)
            }
            Decision::Detour(plan) => {
                self.clear_ticks = 0;
                self.start_detour(route, plan, pose, input, NavEvent::DetourPlanned)
            }
        }
    }

    fn replan<C: CostQuery>(
        &mut self,
        ctx: &NavContext,
        route: &Route,
        pose: &StampedPose,
        input: &StepInput<'_, C>,
        event: NavEvent,
    ) -> Outcome {
        match self
            .planner
            .replan(route, ctx.current_s, pose.position(), input.costmap, input.obstacles, input.now)
        {
            Decision::Detour(plan) => self.start_detour(route, plan, pose, input, event),
            Decision::Blocked(segment) => {
                self.controller.reset();
                Outcome::go(MotionCommand::Stop, NavState::Blocked(segment), NavEvent::NoDetour)
            }
            Decision::Clear => Outcome::stay(MotionCommand::Stop),
        }
    }

    fn start_detour<C: CostQuery>(
        &mut self,
        route: &Route,
        plan: DetourPlan,
        pose: &StampedPose,
        input: &StepInput<'_, C>,
        event: NavEvent,
    ) -> Outcome {
        self.controller.begin(&plan);
        let step = self.controller.step(&plan, route, input.costmap, pose, input.now);
        Outcome::go(command_for(&step), NavState::Deviating(plan), event)
    }

    fn follow_route(&self, route: &Route, s: f64, pose: &StampedPose) -> MotionCommand {
        let gains = self.controller.config().gains();
        let target = route_target(route, s, gains.lookahead(gains.speed));
        MotionCommand::Goto {
            target,
            control: pure_pursuit_steer_control(&pose.pose, target, &gains),
        }
    }

    // Commands never lead through a cell above the blocking threshold.
    fn safety_gate<C: CostQuery>(&self, command: MotionCommand, pose: &StampedPose, costmap: &C) -> MotionCommand {
        let MotionCommand::Goto { target, .. } = command else {
            return command;
        };
        let cfg = self.planner.config();
        let cost = costmap.max_cost_along(pose.position(), target, cfg.robot_radius, cfg.sample_step);
        if cost > cfg.blocking_threshold {
            warn!(
                "safety gate: path to ({:.2}, {:.2}) crosses cost {:.2}, stopping",
                target.x, target.y, cost
            );
            return MotionCommand::Stop;
        }
        command
    }

    fn forget_progress(&mut self) {
        self.controller.reset();
        self.planner.reset_persistence();
        self.clear_ticks = 0;
    }

    fn halt(&mut self, ctx: &mut NavContext, reason: StopReason, now: Timestamp) {
        self.forget_progress();
        ctx.force_stop(reason, now);
    }
}

fn command_for(step: &ReturnStep) -> MotionCommand {
    if step.detour_complete && !step.rejoin_clear {
        return MotionCommand::Stop;
    }
    MotionCommand::Goto {
        target: step.command_waypoint,
        control: step.control,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Pose2D;
    use crate::mapping::Region;

    // Uniform cost everywhere.
    struct Flat(f64);

    impl CostQuery for Flat {
        fn cost_at(&self, _p: Point2D) -> f64 {
            self.0
        }

        fn query(&self, _region: &Region) -> f64 {
            self.0
        }
    }

    fn machine() -> NavigationStateMachine {
        NavigationStateMachine::new(MachineConfig::default(), PlannerConfig::default(), ReturnConfig::default()).unwrap()
    }

    fn context() -> NavContext {
        NavContext::new(Route::new(&[Point2D::new(0.0, 0.0), Point2D::new(10.0, 0.0)]).unwrap())
    }

    fn input<'a>(map: &'a Flat, tracks: &'a TrackSnapshot, pose: Option<&'a StampedPose>, now: f64) -> StepInput<'a, Flat> {
        StepInput {
            costmap: map,
            obstacles: tracks,
            pose,
            health: SensorHealth::default(),
            stop_requested: false,
            now,
        }
    }

    #[test]
    fn test_state_kind_display() {
        assert_eq!(NavStateKind::Deviating.to_string(), "DEVIATING");
        assert_eq!(NavState::Stopped(StopReason::PoseLost).to_string(), "STOPPED(pose_lost)");
    }

    #[test]
    fn test_transition_table() {
        use NavStateKind::*;
        assert!(Following.can_transition(NavEvent::DetourPlanned, Deviating));
        assert!(Returning.can_transition(NavEvent::RejoinBlocked, Deviating));
        assert!(Blocked.can_transition(NavEvent::PathClear, Following));
        assert!(Deviating.can_transition(NavEvent::Stop(StopReason::Operator), Stopped));
        assert!(Stopped.can_transition(NavEvent::Reset, Following));
        assert!(!Blocked.can_transition(NavEvent::Rejoined, Returning));
        assert!(!Following.can_transition(NavEvent::DetourComplete, Returning));
        assert!(!Stopped.can_transition(NavEvent::DetourPlanned, Deviating));
        assert!(!Deviating.can_transition(NavEvent::PathClear, Following));
        assert!(Deviating.can_transition(NavEvent::RouteReplaced, Following));
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut ctx = context();
        let err = ctx
            .transition(NavState::Following, NavEvent::Rejoined, 0.0)
            .unwrap_err();
        assert!(matches!(
            err,
            NavError::InvalidTransition { from: NavStateKind::Following, to: NavStateKind::Following }
        ));
        assert_eq!(ctx.state(), &NavState::Following);
        assert_eq!(ctx.history().count(), 0);
    }

    #[test]
    fn test_follows_clear_route() {
        let mut m = machine();
        let mut ctx = context();
        let map = Flat(0.0);
        let tracks = TrackSnapshot::default();
        let pose = StampedPose::new(Pose2D::new(1.0, 0.0, 0.0), 0.0);
        let cmd = m.step(&mut ctx, &input(&map, &tracks, Some(&pose), 0.0));
        let target = cmd.target().expect("goto");
        assert!(target.x > 1.0 && target.y.abs() < 1e-9);
        assert!((ctx.current_s() - 1.0).abs() < 1e-9);
        assert_eq!(ctx.state().kind(), NavStateKind::Following);
    }

    #[test]
    fn test_pose_loss_stops_until_reset() {
        let mut m = machine();
        let mut ctx = context();
        let map = Flat(0.0);
        let tracks = TrackSnapshot::default();
        assert!(m.step(&mut ctx, &input(&map, &tracks, None, 0.0)).is_stop());
        assert_eq!(ctx.state(), &NavState::Stopped(StopReason::PoseLost));

        // a fresh pose alone does not resume
        let pose = StampedPose::new(Pose2D::new(1.0, 0.0, 0.0), 1.0);
        assert!(m.step(&mut ctx, &input(&map, &tracks, Some(&pose), 1.0)).is_stop());
        ctx.reset(1.0).unwrap();
        assert!(!m.step(&mut ctx, &input(&map, &tracks, Some(&pose), 1.0)).is_stop());
    }

    #[test]
    fn test_stale_pose_counts_as_lost() {
        let mut m = machine();
        let mut ctx = context();
        let map = Flat(0.0);
        let tracks = TrackSnapshot::default();
        let pose = StampedPose::new(Pose2D::new(1.0, 0.0, 0.0), 0.0);
        assert!(m.step(&mut ctx, &input(&map, &tracks, Some(&pose), 2.0)).is_stop());
        assert_eq!(ctx.state().kind(), NavStateKind::Stopped);
    }

    #[test]
    fn test_stop_request() {
        let mut m = machine();
        let mut ctx = context();
        let map = Flat(0.0);
        let tracks = TrackSnapshot::default();
        let pose = StampedPose::new(Pose2D::new(1.0, 0.0, 0.0), 0.0);
        let mut inp = input(&map, &tracks, Some(&pose), 0.0);
        inp.stop_requested = true;
        assert!(m.step(&mut ctx, &inp).is_stop());
        assert_eq!(ctx.state(), &NavState::Stopped(StopReason::Operator));
    }

    #[test]
    fn test_goal_reached() {
        let mut m = machine();
        let mut ctx = context();
        let map = Flat(0.0);
        let tracks = TrackSnapshot::default();
        let pose = StampedPose::new(Pose2D::new(9.9, 0.05, 0.0), 0.0);
        assert!(m.step(&mut ctx, &input(&map, &tracks, Some(&pose), 0.0)).is_stop());
        assert_eq!(ctx.state(), &NavState::Stopped(StopReason::GoalReached));
    }

    #[test]
    fn test_invalid_route_rejected() {
        let mut ctx = context();
        assert!(ctx.assign_route(&[Point2D::origin()], 0.0).is_err());
        assert_eq!(ctx.state(), &NavState::Stopped(StopReason::InvalidRoute));
        assert!(ctx.route().is_none());
        assert!(ctx.reset(0.0).is_err());

        ctx.assign_route(&[Point2D::origin(), Point2D::new(5.0, 0.0)], 1.0).unwrap();
        assert_eq!(ctx.state(), &NavState::Following);
        let events: Vec<NavEvent> = ctx.history().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![NavEvent::Stop(StopReason::InvalidRoute), NavEvent::RouteReplaced]
        );
    }

    #[test]
    fn test_idle_context_needs_route() {
        let mut m = machine();
        let mut ctx = NavContext::idle();
        let map = Flat(0.0);
        let tracks = TrackSnapshot::default();
        let pose = StampedPose::new(Pose2D::origin(), 0.0);
        assert!(m.step(&mut ctx, &input(&map, &tracks, Some(&pose), 0.0)).is_stop());
        assert_eq!(ctx.state(), &NavState::Stopped(StopReason::NoRoute));
    }

    #[test]
    fn test_blind_holds_without_transition() {
        let mut m = machine();
        let mut ctx = context();
        let map = Flat(0.0);
        let tracks = TrackSnapshot::default();
        let pose = StampedPose::new(Pose2D::new(1.0, 0.0, 0.0), 0.0);
        let mut inp = input(&map, &tracks, Some(&pose), 0.0);
        inp.health = SensorHealth {
            vision_missed_ticks: 20,
            range_missed_ticks: 20,
            vision_dropped: true,
            range_dropped: true,
        };
        assert!(m.step(&mut ctx, &inp).is_stop());
        assert_eq!(ctx.state(), &NavState::Following);
    }

    #[test]
    fn test_safety_gate_stops_in_high_cost() {
        let mut m = machine();
        let mut ctx = context();
        let map = Flat(0.9);
        let tracks = TrackSnapshot::default();
        let pose = StampedPose::new(Pose2D::new(1.0, 0.0, 0.0), 0.0);
        // a uniformly lethal map reads as blocked but unconfirmed on the first tick
        assert!(m.step(&mut ctx, &input(&map, &tracks, Some(&pose), 0.0)).is_stop());
        assert_eq!(ctx.state().kind(), NavStateKind::Following);
    }

    #[test]
    fn test_route_replacement_restarts_persistence() {
        let mut m = machine();
        let mut ctx = context();
        let map = Flat(0.9);
        let tracks = TrackSnapshot::default();
        let points = [Point2D::new(0.0, 0.0), Point2D::new(10.0, 0.0)];

        let mut now = 0.0;
        let mut ticks = 0;
        while ctx.state().kind() == NavStateKind::Following {
            let pose = StampedPose::new(Pose2D::new(1.0, 0.0, 0.0), now);
            m.step(&mut ctx, &input(&map, &tracks, Some(&pose), now));
            ticks += 1;
            now += 0.1;
        }
        assert_eq!(ticks, 3);
        assert_eq!(ctx.state().kind(), NavStateKind::Blocked);
        assert_eq!(m.planner().streak(), 3);

        ctx.assign_route(&points, now).unwrap();
        let pose = StampedPose::new(Pose2D::new(1.0, 0.0, 0.0), now);
        m.step(&mut ctx, &input(&map, &tracks, Some(&pose), now));
        assert_eq!(ctx.state().kind(), NavStateKind::Following);
        assert_eq!(m.planner().streak(), 1);
    }

    #[test]
    fn test_reset_after_operator_stop_restarts_persistence() {
        let mut m = machine();
        let mut ctx = context();
        let lethal = Flat(0.9);
        let tracks = TrackSnapshot::default();
        let pose = StampedPose::new(Pose2D::new(1.0, 0.0, 0.0), 0.0);
        m.step(&mut ctx, &input(&lethal, &tracks, Some(&pose), 0.0));
        m.step(&mut ctx, &input(&lethal, &tracks, Some(&pose), 0.0));
        assert_eq!(m.planner().streak(), 2);

        let mut inp = input(&lethal, &tracks, Some(&pose), 0.0);
        inp.stop_requested = true;
        m.step(&mut ctx, &inp);
        ctx.reset(0.0).unwrap();
        m.step(&mut ctx, &input(&lethal, &tracks, Some(&pose), 0.0));
        assert_eq!(ctx.state().kind(), NavStateKind::Following);
        assert_eq!(m.planner().streak(), 1);
    }

    #[test]
    fn test_stop_recorded_from_every_state() {
        for kind in NavStateKind::ALL {
            assert!(kind.can_transition(NavEvent::Stop(StopReason::Fault), NavStateKind::Stopped));
        }
        let mut ctx = context();
        ctx.force_stop(StopReason::PoseLost, 1.0);
        ctx.force_stop(StopReason::Operator, 2.0);
        assert_eq!(ctx.state(), &NavState::Stopped(StopReason::Operator));
        let events: Vec<NavEvent> = ctx.history().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![NavEvent::Stop(StopReason::PoseLost), NavEvent::Stop(StopReason::Operator)]
        );
    }

    #[test]
    fn test_render_history_and_diagram() {
        let mut ctx = context();
        ctx.force_stop(StopReason::Operator, 1.5);
        let text = ctx.render_history();
        assert!(text.contains("FOLLOWING --[stop(operator)]--> STOPPED"));
        let diagram = transition_diagram();
        assert!(diagram.contains("RETURNING --[rejoin_blocked]--> DEVIATING"));
    }
}
