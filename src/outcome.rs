use serde::Serialize;

use crate::admin::ListSource;
use crate::calendar::{CalendarView, MonthKey};
use crate::forms::FormErrors;
use crate::model::{DateSpan, Reservation, Room};
use crate::workflow::DraftReservation;

/// Where a redirect sends the visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Route {
    Home,
    Search,
    MakeReservation,
    Summary,
    AdminNew,
    AdminAll,
    AdminCalendar(MonthKey),
}

impl Route {
    pub fn path(&self) -> String {
        match self {
            Route::Home => "/".into(),
            Route::Search => "/search-availability".into(),
            Route::MakeReservation => "/make-reservation".into(),
            Route::Summary => "/reservation-summary".into(),
            Route::AdminNew => "/admin/reservations-new".into(),
            Route::AdminAll => "/admin/reservations-all".into(),
            Route::AdminCalendar(month) => {
                format!("/admin/reservations-calendar?y={}&m={:02}", month.year(), month.month())
            }
        }
    }
}

/// Plain read models handed to the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Page {
    ChooseRoom { span: DateSpan, rooms: Vec<Room> },
    MakeReservation { draft: DraftReservation, errors: FormErrors },
    Summary { reservation: Reservation },
    Reservations { src: ListSource, reservations: Vec<Reservation> },
    ShowReservation { src: ListSource, reservation: Reservation, errors: FormErrors },
    Calendar(CalendarView),
}

/// What a handler asks the web layer to do.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Outcome {
    Render(Page),
    Redirect(Route),
}

impl Outcome {
    pub fn status(&self) -> u16 {
        match self {
            Outcome::Render(_) => 200,
            Outcome::Redirect(_) => 303,
        }
    }

    pub fn redirect_target(&self) -> Option<Route> {
        match self {
            Outcome::Redirect(route) => Some(*route),
            Outcome::Render(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(Outcome::Redirect(Route::Home).status(), 303);
        let page = Page::Reservations { src: ListSource::All, reservations: Vec::new() };
        assert_eq!(Outcome::Render(page).status(), 200);
    }

    #[test]
    fn paths() {
        assert_eq!(Route::Search.path(), "/search-availability");
        let march = MonthKey::new(2024, 3).unwrap();
        assert_eq!(Route::AdminCalendar(march).path(), "/admin/reservations-calendar?y=2024&m=03");
    }
}
