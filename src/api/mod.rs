use rocket::Route;

mod auth;
mod polls;
mod users;

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(auth::routes());
    routes.extend(polls::routes());
    routes.extend(users::routes());
    routes
}
